use super::*;
use chrono::{Duration, TimeZone};
use serde_json::json;
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn sample_key(store: &Store, provider: &str, priority: i64) -> ProviderKey {
    store
        .insert_key(
            &NewKey {
                provider: provider.into(),
                display_name: format!("{}-{}", provider, priority),
                api_key: "sk-test".into(),
                environment: "prod".into(),
                max_rpm: None,
                max_tpm: None,
                priority,
                status: KeyStatus::Active,
            },
            now(),
        )
        .unwrap()
}

#[test]
fn insert_and_get_key_round_trip() {
    let store = Store::open_in_memory().unwrap();
    let key = sample_key(&store, "openai", 100);

    let loaded = store.get_key(key.id).unwrap().unwrap();
    assert_eq!(loaded.provider, "openai");
    assert_eq!(loaded.api_key, "sk-test");
    assert_eq!(loaded.priority, 100);
    assert_eq!(loaded.status, KeyStatus::Active);
    assert_eq!(loaded.error_count_recent, 0);
    assert_eq!(loaded.created_at, now());
    assert!(loaded.cooling_until.is_none());
}

#[test]
fn list_keys_sorted_and_filtered() {
    let store = Store::open_in_memory().unwrap();
    sample_key(&store, "openai", 200);
    sample_key(&store, "openai", 100);
    sample_key(&store, "anthropic", 50);

    let all = store.list_keys(None, None).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].priority, 50);
    assert_eq!(all[1].priority, 100);

    let openai = store.list_keys(Some("openai"), None).unwrap();
    assert_eq!(openai.len(), 2);
    assert!(openai.iter().all(|k| k.provider == "openai"));

    let disabled = store.list_keys(None, Some(KeyStatus::Disabled)).unwrap();
    assert!(disabled.is_empty());
}

#[test]
fn selectable_keys_exclude_disabled() {
    let store = Store::open_in_memory().unwrap();
    let a = sample_key(&store, "openai", 100);
    let b = sample_key(&store, "openai", 200);

    let mut disabled = store.get_key(b.id).unwrap().unwrap();
    disabled.status = KeyStatus::Disabled;
    store.save_key_health(&disabled, now()).unwrap();

    let selectable = store.list_selectable_keys("openai").unwrap();
    assert_eq!(selectable.len(), 1);
    assert_eq!(selectable[0].id, a.id);
}

#[test]
fn update_key_partial() {
    let store = Store::open_in_memory().unwrap();
    let key = sample_key(&store, "openai", 100);

    let updated = store
        .update_key(
            key.id,
            &KeyUpdate {
                priority: Some(10),
                max_rpm: Some(5),
                ..KeyUpdate::default()
            },
            now() + Duration::seconds(5),
        )
        .unwrap()
        .unwrap();

    assert_eq!(updated.priority, 10);
    assert_eq!(updated.max_rpm, Some(5));
    // Untouched fields preserved
    assert_eq!(updated.display_name, key.display_name);
    assert_eq!(updated.api_key, "sk-test");
    assert!(updated.updated_at > key.updated_at);
}

#[test]
fn update_missing_key_returns_none() {
    let store = Store::open_in_memory().unwrap();
    let result = store
        .update_key(Uuid::new_v4(), &KeyUpdate::default(), now())
        .unwrap();
    assert!(result.is_none());
}

#[test]
fn delete_key() {
    let store = Store::open_in_memory().unwrap();
    let key = sample_key(&store, "openai", 100);
    assert!(store.delete_key(key.id).unwrap());
    assert!(store.get_key(key.id).unwrap().is_none());
    assert!(!store.delete_key(key.id).unwrap());
}

#[test]
fn save_key_health_round_trip() {
    let store = Store::open_in_memory().unwrap();
    let mut key = sample_key(&store, "openai", 100);

    key.status = KeyStatus::CoolingDown;
    key.error_count_recent = 3;
    key.last_error_at = Some(now());
    key.cooling_until = Some(now() + Duration::seconds(30));
    store.save_key_health(&key, now()).unwrap();

    let loaded = store.get_key(key.id).unwrap().unwrap();
    assert_eq!(loaded.status, KeyStatus::CoolingDown);
    assert_eq!(loaded.error_count_recent, 3);
    assert_eq!(loaded.cooling_until, Some(now() + Duration::seconds(30)));
}

#[test]
fn effectively_active_respects_cooling_and_disabled() {
    let store = Store::open_in_memory().unwrap();
    let mut key = sample_key(&store, "openai", 100);
    assert!(key.effectively_active(now()));

    key.cooling_until = Some(now() + Duration::seconds(10));
    assert!(!key.effectively_active(now()));
    // Cooling elapsed
    assert!(key.effectively_active(now() + Duration::seconds(10)));

    key.status = KeyStatus::Disabled;
    key.cooling_until = None;
    assert!(!key.effectively_active(now() + Duration::hours(1)));
}

#[test]
fn parse_utc_promotes_naive_timestamps() {
    let aware = parse_utc("2025-06-01T12:00:00+02:00").unwrap();
    assert_eq!(aware, Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap());

    let naive = parse_utc("2025-06-01T12:00:00").unwrap();
    assert_eq!(naive, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());

    let spaced = parse_utc("2025-06-01 12:00:00.500").unwrap();
    assert_eq!(spaced.timestamp_subsec_millis(), 500);

    assert!(parse_utc("not-a-timestamp").is_err());
}

#[test]
fn run_insert_and_transitions() {
    let store = Store::open_in_memory().unwrap();
    let messages = json!([{"role": "user", "content": "hi"}]);
    let run = store
        .insert_run("openai", Some("gpt-4o"), Some(256), &messages, None, now())
        .unwrap();

    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.input_messages, messages);
    assert_eq!(run.retry_count, 0);
    assert!(run.started_at.is_none());

    assert!(store.mark_run_queued(run.id, now()).unwrap());
    assert!(store.mark_run_running(run.id, now()).unwrap());
    let running = store.get_run(run.id).unwrap().unwrap();
    assert_eq!(running.status, RunStatus::Running);
    assert_eq!(running.started_at, Some(now()));

    let output = json!({"role": "assistant", "content": "hello"});
    assert!(store.mark_run_succeeded(run.id, &output, 2, now()).unwrap());
    let done = store.get_run(run.id).unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Succeeded);
    assert_eq!(done.output_message, Some(output));
    assert_eq!(done.retry_count, 2);
    assert_eq!(done.finished_at, Some(now()));
}

#[test]
fn terminal_runs_never_regress() {
    let store = Store::open_in_memory().unwrap();
    let run = store
        .insert_run("openai", None, None, &json!([]), None, now())
        .unwrap();
    assert!(store.mark_run_failed(run.id, "boom", 5, None, now()).unwrap());

    // Every transition out of a terminal state is refused
    assert!(!store.mark_run_queued(run.id, now()).unwrap());
    assert!(!store.mark_run_running(run.id, now()).unwrap());
    assert!(!store.mark_run_canceled(run.id, now()).unwrap());
    assert!(
        !store
            .mark_run_succeeded(run.id, &json!({}), 0, now())
            .unwrap()
    );

    let still = store.get_run(run.id).unwrap().unwrap();
    assert_eq!(still.status, RunStatus::Failed);
    assert_eq!(still.error.as_deref(), Some("boom"));
}

#[test]
fn idempotency_key_is_unique_and_findable() {
    let store = Store::open_in_memory().unwrap();
    let run = store
        .insert_run("openai", None, None, &json!([]), Some("dedupe-1"), now())
        .unwrap();

    let found = store.find_run_by_idempotency_key("dedupe-1").unwrap().unwrap();
    assert_eq!(found.id, run.id);
    assert!(store.find_run_by_idempotency_key("other").unwrap().is_none());

    // Second insert with the same key violates the unique constraint
    let dup = store.insert_run("openai", None, None, &json!([]), Some("dedupe-1"), now());
    assert!(dup.is_err());
}

#[test]
fn mark_retrying_sets_queued_with_reason() {
    let store = Store::open_in_memory().unwrap();
    let run = store
        .insert_run("openai", None, None, &json!([]), None, now())
        .unwrap();
    store.mark_run_running(run.id, now()).unwrap();

    assert!(
        store
            .mark_run_retrying(run.id, 1, "Rate limit: slow down", now())
            .unwrap()
    );
    let queued = store.get_run(run.id).unwrap().unwrap();
    assert_eq!(queued.status, RunStatus::Queued);
    assert_eq!(queued.retry_count, 1);
    assert_eq!(
        queued.last_error_reason.as_deref(),
        Some("Rate limit: slow down")
    );
    assert!(queued.finished_at.is_none());
}

#[test]
fn rotation_cursor_increments_per_provider() {
    let store = Store::open_in_memory().unwrap();
    assert_eq!(store.next_rotation_index("openai").unwrap(), 0);
    assert_eq!(store.next_rotation_index("openai").unwrap(), 1);
    assert_eq!(store.next_rotation_index("openai").unwrap(), 2);
    // Independent cursor per provider
    assert_eq!(store.next_rotation_index("anthropic").unwrap(), 0);
}

#[test]
fn token_samples_append_prune_and_count() {
    let store = Store::open_in_memory().unwrap();
    let key_id = Uuid::new_v4();
    store.append_token_sample(key_id, 1000, 10).unwrap();
    store.append_token_sample(key_id, 2000, 20).unwrap();
    store.append_token_sample(key_id, 3000, 30).unwrap();

    assert_eq!(store.token_sample_count(key_id).unwrap(), 3);
    assert_eq!(
        store.token_samples_since(key_id, 2000).unwrap(),
        vec![(2000, 20), (3000, 30)]
    );

    assert_eq!(store.prune_token_samples(key_id, 2000).unwrap(), 1);
    assert_eq!(store.token_sample_count(key_id).unwrap(), 2);

    assert_eq!(store.token_sample_key_ids().unwrap(), vec![key_id]);
}

#[test]
fn expire_idle_token_lists_drops_whole_keys() {
    let store = Store::open_in_memory().unwrap();
    let stale = Uuid::new_v4();
    let fresh = Uuid::new_v4();
    store.append_token_sample(stale, 1000, 10).unwrap();
    store.append_token_sample(fresh, 1000, 10).unwrap();
    store.append_token_sample(fresh, 9000, 10).unwrap();

    let expired = store.expire_idle_token_lists(5000).unwrap();
    assert_eq!(expired, 1);
    assert_eq!(store.token_sample_count(stale).unwrap(), 0);
    // Fresh key keeps even its old samples; record-time pruning handles those
    assert_eq!(store.token_sample_count(fresh).unwrap(), 2);
}

#[test]
fn job_queue_claims_in_due_order() {
    let store = Store::open_in_memory().unwrap();
    let run_a = Uuid::new_v4();
    let run_b = Uuid::new_v4();

    store
        .enqueue_job(run_a, 1, now() + Duration::seconds(30), now())
        .unwrap();
    store.enqueue_job(run_b, 2, now(), now()).unwrap();

    // Only run_b is due now
    let first = store.claim_due_job(now()).unwrap().unwrap();
    assert_eq!(first, QueuedJob { run_id: run_b, attempt: 2 });
    assert!(store.claim_due_job(now()).unwrap().is_none());

    // run_a becomes due after its delay
    let later = now() + Duration::seconds(30);
    let second = store.claim_due_job(later).unwrap().unwrap();
    assert_eq!(second.run_id, run_a);
    assert_eq!(second.attempt, 1);
    assert!(store.claim_due_job(later).unwrap().is_none());
}

#[test]
fn stored_file_round_trip() {
    let store = Store::open_in_memory().unwrap();
    let file = store
        .insert_stored_file("cat.png", "image/png", 2048, "storage/cat.png", now())
        .unwrap();

    let loaded = store.get_stored_file(file.id).unwrap().unwrap();
    assert_eq!(loaded.filename, "cat.png");
    assert_eq!(loaded.mime_type, "image/png");
    assert_eq!(loaded.size_bytes, 2048);

    let resolved = store
        .get_stored_files(&[file.id.to_string(), "not-a-uuid".into(), Uuid::new_v4().to_string()])
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, file.id);
}
