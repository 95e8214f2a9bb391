use super::*;
use crate::providers::base::ChatMessage;
use crate::runs::{CreateRunRequest, create_run};
use crate::store::{KeyStatus, NewKey};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_state(server: &MockServer) -> Arc<AppState> {
    AppState::in_memory(AppSettings {
        openai_base_url: server.uri(),
        ..AppSettings::default()
    })
}

fn add_key(state: &AppState, api_key: &str) {
    state
        .store
        .insert_key(
            &NewKey {
                provider: "openai".into(),
                display_name: api_key.into(),
                api_key: api_key.into(),
                environment: "prod".into(),
                max_rpm: None,
                max_tpm: None,
                priority: 100,
                status: KeyStatus::Active,
            },
            Utc::now(),
        )
        .unwrap();
}

fn make_run(state: &AppState, content: &str) -> Uuid {
    let ticket = create_run(
        state,
        &CreateRunRequest {
            provider: None,
            model: None,
            messages: vec![ChatMessage::user(content)],
            max_tokens: None,
            idempotency_key: None,
        },
    )
    .unwrap();
    ticket.run_id
}

fn success_body(text: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "gpt-4o-mini",
        "choices": [{"message": {"role": "assistant", "content": text}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

#[test]
fn backoff_is_exponential_and_capped() {
    let settings = AppSettings::default();
    assert_eq!(backoff_delay(&settings, 1, None), 5);
    assert_eq!(backoff_delay(&settings, 2, None), 10);
    assert_eq!(backoff_delay(&settings, 3, None), 20);
    assert_eq!(backoff_delay(&settings, 4, None), 40);
    // 5 * 2^4 = 80 caps at 60
    assert_eq!(backoff_delay(&settings, 5, None), 60);
    assert_eq!(backoff_delay(&settings, 30, None), 60);
}

#[test]
fn backoff_prefers_retry_after_hint_with_cap() {
    let settings = AppSettings::default();
    assert_eq!(backoff_delay(&settings, 1, Some(42)), 42);
    assert_eq!(backoff_delay(&settings, 1, Some(300)), 60);
}

#[tokio::test]
async fn transient_then_success_retries_with_backoff() {
    let server = MockServer::start().await;
    // First call fails transiently, everything after succeeds
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("done")))
        .mount(&server)
        .await;

    let state = test_state(&server);
    add_key(&state, "sk-a");
    let run_id = make_run(&state, "hello");

    let job = state.queue.claim_due(Utc::now()).unwrap().unwrap();
    assert_eq!(job.attempt, 1);
    let before = Utc::now();
    process_run_job(&state, job.run_id, job.attempt).await;

    // Attempt 1 failed retriably: back to queued with bookkeeping
    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.retry_count, 1);
    assert!(run.last_error_reason.as_deref().unwrap().contains("Transient"));

    // Re-enqueued at attempt 2, due ~5s out
    let pending = state.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1, 2);
    let delay = (pending[0].2 - before).num_seconds();
    assert!((4..=6).contains(&delay), "delay was {}s", delay);

    // Attempt 2 succeeds. The key is still cooling from attempt 1 on the
    // real clock, so expire its cooling as the 15s passing would
    let mut key = state.store.list_keys(None, None).unwrap().remove(0);
    key.cooling_until = Some(Utc::now() - Duration::seconds(1));
    state.store.save_key_health(&key, Utc::now()).unwrap();

    let due = Utc::now() + Duration::seconds(10);
    let job = state.queue.claim_due(due).unwrap().unwrap();
    process_run_job(&state, job.run_id, job.attempt).await;

    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.retry_count, 1);
    assert!(run.finished_at.is_some());
    let output = run.output_message.unwrap();
    assert_eq!(output["content"], "done");
    assert_eq!(output["role"], "assistant");
}

#[tokio::test]
async fn client_error_fails_terminally_on_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"type": "invalid_request_error", "message": "bad"}
        })))
        .mount(&server)
        .await;

    let state = test_state(&server);
    add_key(&state, "sk-a");
    let run_id = make_run(&state, "hello");

    let job = state.queue.claim_due(Utc::now()).unwrap().unwrap();
    process_run_job(&state, job.run_id, job.attempt).await;

    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.retry_count, 1);
    assert!(run.error.as_deref().unwrap().contains("Client error"));
    assert!(run.finished_at.is_some());
    // Nothing left in the queue
    assert!(state.queue.pending().unwrap().is_empty());
}

#[tokio::test]
async fn canceled_run_is_skipped_without_upstream_calls() {
    let server = MockServer::start().await;
    let state = test_state(&server);
    add_key(&state, "sk-a");
    let run_id = make_run(&state, "hello");
    crate::runs::cancel_run(&state, run_id).unwrap();

    let job = state.queue.claim_due(Utc::now()).unwrap().unwrap();
    process_run_job(&state, job.run_id, job.attempt).await;

    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert!(run.started_at.is_none());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn no_keys_is_retriable_until_attempt_ceiling() {
    let server = MockServer::start().await;
    let state = test_state(&server);
    // No keys registered at all
    let run_id = make_run(&state, "hello");

    let job = state.queue.claim_due(Utc::now()).unwrap().unwrap();
    process_run_job(&state, job.run_id, job.attempt).await;

    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.last_error_reason.as_deref(), Some("No available keys"));

    // At the ceiling the same condition goes terminal
    let max = state.settings.worker_max_attempts;
    process_run_job(&state, run_id, max).await;
    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.retry_count, max);
    assert!(run.error.as_deref().unwrap().contains("after 5 attempts"));
}

#[tokio::test]
async fn rate_limit_hint_drives_requeue_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "42")
                .set_body_json(serde_json::json!({"error": {"message": "limit"}})),
        )
        .mount(&server)
        .await;

    let state = test_state(&server);
    add_key(&state, "sk-a");
    let run_id = make_run(&state, "hello");

    let before = Utc::now();
    let job = state.queue.claim_due(Utc::now()).unwrap().unwrap();
    process_run_job(&state, job.run_id, job.attempt).await;

    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.last_error_reason.as_deref().unwrap().contains("Rate limit"));

    let pending = state.queue.pending().unwrap();
    let delay = (pending[0].2 - before).num_seconds();
    assert!((41..=43).contains(&delay), "delay was {}s", delay);
}

#[tokio::test]
async fn missing_run_does_not_panic_or_write() {
    let server = MockServer::start().await;
    let state = test_state(&server);
    process_run_job(&state, Uuid::new_v4(), 1).await;
    assert!(state.queue.pending().unwrap().is_empty());
}

#[tokio::test]
async fn worker_failover_tries_multiple_keys_within_one_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(wiremock::matchers::header("Authorization", "Bearer sk-a"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(wiremock::matchers::header("Authorization", "Bearer sk-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("ok")))
        .mount(&server)
        .await;

    let state = test_state(&server);
    add_key(&state, "sk-a");
    add_key(&state, "sk-b");
    let run_id = make_run(&state, "hello");

    let job = state.queue.claim_due(Utc::now()).unwrap().unwrap();
    process_run_job(&state, job.run_id, job.attempt).await;

    // The in-attempt failover reached the healthy key: no re-enqueue needed
    let run = state.store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.retry_count, 0);
    assert!(state.queue.pending().unwrap().is_empty());
}
