use super::*;
use std::io::Write as _;

#[test]
fn defaults_match_documented_values() {
    let s = AppSettings::default();
    assert_eq!(s.key_rpm_window_seconds, 60);
    assert_eq!(s.key_cooldown_seconds_on_429, 30);
    assert_eq!(s.key_cooldown_seconds_on_network_error, 15);
    assert_eq!(s.key_error_decay_minutes, 10);
    assert_eq!(s.sync_llm_max_retries, 2);
    assert_eq!(s.worker_max_attempts, 5);
    assert_eq!(s.worker_base_backoff_seconds, 5);
    assert_eq!(s.worker_max_backoff_seconds, 60);
    assert_eq!(s.provider_timeout_seconds, 1800);
    assert_eq!(s.default_max_tokens, 1024);
    assert!(s.api_auth_token.is_none());
}

#[test]
fn load_without_config_file_uses_defaults() {
    let s = AppSettings::load(None).unwrap();
    assert_eq!(s.openai_default_model, "gpt-4o-mini");
    assert_eq!(s.deepseek_base_url, "https://api.deepseek.com/v1");
}

#[test]
fn load_partial_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"sync_llm_max_retries": 4, "openai_default_model": "gpt-4o"}}"#
    )
    .unwrap();

    let s = AppSettings::load(Some(file.path())).unwrap();
    assert_eq!(s.sync_llm_max_retries, 4);
    assert_eq!(s.openai_default_model, "gpt-4o");
    // Untouched fields keep their defaults
    assert_eq!(s.worker_max_attempts, 5);
}

#[test]
fn load_rejects_unknown_fields() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"no_such_setting": 1}}"#).unwrap();

    assert!(AppSettings::load(Some(file.path())).is_err());
}

#[test]
fn load_missing_file_is_an_error() {
    let result = AppSettings::load(Some(std::path::Path::new("/nonexistent/keygate.json")));
    assert!(result.is_err());
}

#[test]
fn validate_rejects_zero_rpm_window() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"key_rpm_window_seconds": 0}}"#).unwrap();

    let err = AppSettings::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("key_rpm_window_seconds"));
}

#[test]
fn validate_rejects_zero_worker_attempts() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"worker_max_attempts": 0}}"#).unwrap();

    assert!(AppSettings::load(Some(file.path())).is_err());
}
