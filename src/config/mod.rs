use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Application settings, loaded from an optional JSON config file with
/// environment-variable overrides for deploy-specific fields applied on top.
/// Every field has a default so a bare `keygate serve` works out of the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppSettings {
    pub database_path: String,
    pub bind_addr: String,
    /// Static bearer token for the API surface. `None` disables auth (dev).
    pub api_auth_token: Option<String>,
    pub public_base_url: String,
    /// Directory holding uploaded files referenced by chat attachments.
    pub storage_dir: String,

    // Key pool behavior
    pub key_rpm_window_seconds: u64,
    pub key_cooldown_seconds_on_429: u64,
    pub key_cooldown_seconds_on_network_error: u64,
    pub key_error_decay_minutes: u64,

    // Sync endpoint retries
    pub sync_llm_max_retries: u32,

    // Async worker retries
    pub worker_max_attempts: u32,
    pub worker_base_backoff_seconds: u64,
    pub worker_max_backoff_seconds: u64,
    pub worker_poll_interval_ms: u64,

    // Upstream call behavior
    pub provider_timeout_seconds: u64,
    pub default_max_tokens: u32,

    // Per-provider endpoints and defaults
    pub openai_base_url: String,
    pub openai_default_model: String,
    pub anthropic_base_url: String,
    pub anthropic_default_model: String,
    pub gemini_base_url: String,
    pub gemini_default_model: String,
    pub deepseek_base_url: String,
    pub deepseek_default_model: String,

    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_path: "keygate.db".into(),
            bind_addr: "127.0.0.1:8080".into(),
            api_auth_token: None,
            public_base_url: "http://localhost:8080".into(),
            storage_dir: "storage".into(),
            key_rpm_window_seconds: 60,
            key_cooldown_seconds_on_429: 30,
            key_cooldown_seconds_on_network_error: 15,
            key_error_decay_minutes: 10,
            sync_llm_max_retries: 2,
            worker_max_attempts: 5,
            worker_base_backoff_seconds: 5,
            worker_max_backoff_seconds: 60,
            worker_poll_interval_ms: 500,
            provider_timeout_seconds: 1800,
            default_max_tokens: 1024,
            openai_base_url: "https://api.openai.com/v1".into(),
            openai_default_model: "gpt-4o-mini".into(),
            anthropic_base_url: "https://api.anthropic.com".into(),
            anthropic_default_model: "claude-sonnet-4-5-20250929".into(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            gemini_default_model: "gemini-pro".into(),
            deepseek_base_url: "https://api.deepseek.com/v1".into(),
            deepseek_default_model: "deepseek-chat".into(),
            http_proxy: None,
            https_proxy: None,
        }
    }
}

impl AppSettings {
    /// Load settings: config file (if present) → env overrides → validate.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?
            }
            Some(path) => {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            None => Self::default(),
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Env vars beat the config file for deploy-specific fields
    /// (secrets, endpoints, paths).
    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 6] = [
            ("KEYGATE_DB", &mut self.database_path),
            ("KEYGATE_BIND", &mut self.bind_addr),
            ("KEYGATE_PUBLIC_BASE_URL", &mut self.public_base_url),
            ("KEYGATE_STORAGE_DIR", &mut self.storage_dir),
            ("OPENAI_BASE_URL", &mut self.openai_base_url),
            ("ANTHROPIC_BASE_URL", &mut self.anthropic_base_url),
        ];
        for (var, field) in overrides {
            if let Ok(value) = std::env::var(var)
                && !value.is_empty()
            {
                *field = value;
            }
        }

        if let Ok(value) = std::env::var("GEMINI_BASE_URL")
            && !value.is_empty()
        {
            self.gemini_base_url = value;
        }
        if let Ok(value) = std::env::var("DEEPSEEK_BASE_URL")
            && !value.is_empty()
        {
            self.deepseek_base_url = value;
        }
        if let Ok(value) = std::env::var("KEYGATE_AUTH_TOKEN")
            && !value.is_empty()
        {
            self.api_auth_token = Some(value);
        }
        if let Ok(value) = std::env::var("HTTP_PROXY")
            && !value.is_empty()
        {
            self.http_proxy = Some(value);
        }
        if let Ok(value) = std::env::var("HTTPS_PROXY")
            && !value.is_empty()
        {
            self.https_proxy = Some(value);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.key_rpm_window_seconds == 0 {
            anyhow::bail!("key_rpm_window_seconds must be positive");
        }
        if self.sync_llm_max_retries > 20 {
            anyhow::bail!("sync_llm_max_retries is unreasonably large (max 20)");
        }
        if self.worker_max_attempts == 0 {
            anyhow::bail!("worker_max_attempts must be at least 1");
        }
        if self.worker_base_backoff_seconds == 0 {
            anyhow::bail!("worker_base_backoff_seconds must be positive");
        }
        if self.provider_timeout_seconds == 0 {
            anyhow::bail!("provider_timeout_seconds must be positive");
        }
        if self.default_max_tokens == 0 {
            anyhow::bail!("default_max_tokens must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
