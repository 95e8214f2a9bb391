use super::*;
use crate::errors::ErrorKind;

fn request_with(messages: Vec<ChatMessage>) -> ChatRequest {
    ChatRequest {
        messages,
        model: None,
        temperature: None,
        max_tokens: None,
        provider: None,
    }
}

#[test]
fn attachment_file_ids_dedupe_across_messages() {
    let mut first = ChatMessage::user("look");
    first.attachments = Some(vec![
        ChatAttachment {
            file_id: "a".into(),
            kind: AttachmentKind::Image,
        },
        ChatAttachment {
            file_id: "b".into(),
            kind: AttachmentKind::File,
        },
    ]);
    let mut second = ChatMessage::user("again");
    second.attachments = Some(vec![ChatAttachment {
        file_id: "a".into(),
        kind: AttachmentKind::Image,
    }]);

    let request = request_with(vec![first, second]);
    assert_eq!(request.attachment_file_ids(), vec!["a", "b"]);
    assert!(request.has_attachments());
}

#[test]
fn no_attachments_detected_for_plain_messages() {
    let request = request_with(vec![ChatMessage::user("hi")]);
    assert!(request.attachment_file_ids().is_empty());
    assert!(!request.has_attachments());
}

#[test]
fn usage_prefers_reported_total() {
    let usage = Usage {
        prompt_tokens: Some(10),
        completion_tokens: Some(5),
        total_tokens: Some(99),
    };
    assert_eq!(usage.total_or_sum(), 99);
}

#[test]
fn usage_sums_when_total_absent() {
    let usage = Usage {
        prompt_tokens: Some(10),
        completion_tokens: Some(5),
        total_tokens: None,
    };
    assert_eq!(usage.total_or_sum(), 15);

    let partial = Usage {
        prompt_tokens: None,
        completion_tokens: Some(5),
        total_tokens: None,
    };
    assert_eq!(partial.total_or_sum(), 5);
}

#[test]
fn simulated_failure_hooks() {
    let rate_limited = request_with(vec![ChatMessage::user("force429")]);
    let err = simulated_failure(&rate_limited).unwrap();
    assert_eq!(err.kind(), Some(ErrorKind::RateLimit));
    assert_eq!(err.retry_after(), Some(30));

    let transient = request_with(vec![ChatMessage::user("force_transient_error")]);
    let err = simulated_failure(&transient).unwrap();
    assert_eq!(err.kind(), Some(ErrorKind::Transient));

    // Only the first message triggers the hook
    let second_message = request_with(vec![
        ChatMessage::user("hello"),
        ChatMessage::user("force429"),
    ]);
    assert!(simulated_failure(&second_message).is_none());
}

#[test]
fn chat_message_serialization_matches_wire_shape() {
    let mut message = ChatMessage::user("hi");
    message.attachments = Some(vec![ChatAttachment {
        file_id: "f-1".into(),
        kind: AttachmentKind::Document,
    }]);

    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "role": "user",
            "content": "hi",
            "attachments": [{"file_id": "f-1", "type": "document"}]
        })
    );

    let back: ChatMessage = serde_json::from_value(value).unwrap();
    assert_eq!(back.role, Role::User);
    assert_eq!(back.attachments.unwrap()[0].kind, AttachmentKind::Document);
}

#[test]
fn plain_message_omits_attachments_key() {
    let value = serde_json::to_value(ChatMessage::assistant("done")).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"role": "assistant", "content": "done"})
    );
}

#[test]
fn resolve_storage_path_variants() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("img.png"), b"x").unwrap();

    // Relative to the storage dir
    let p = resolve_storage_path(dir.path(), "img.png").unwrap();
    assert!(p.ends_with("img.png"));

    // Legacy values carrying the storage/ prefix
    let p = resolve_storage_path(dir.path(), "storage/img.png").unwrap();
    assert!(p.ends_with("img.png"));

    // Absolute path used as-is
    let abs = dir.path().join("img.png");
    let p = resolve_storage_path(dir.path(), abs.to_str().unwrap()).unwrap();
    assert_eq!(p, abs);

    assert!(resolve_storage_path(dir.path(), "missing.png").is_none());
    assert!(resolve_storage_path(dir.path(), "").is_none());
}
