use anyhow::{Context, Result};
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppSettings;
use crate::errors::GatewayError;

pub mod anthropic;
pub mod base;
pub mod errors;
pub mod gemini;
pub mod openai;

pub use base::{ChatProvider, ChatRequest, ChatResponse, StoredFiles};

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Shared HTTP client for all adapters: long request timeout (async runs may
/// legitimately run for minutes) and outbound proxies from settings.
pub(crate) fn build_http_client(settings: &AppSettings) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(settings.provider_timeout_seconds));

    if let Some(proxy) = &settings.http_proxy {
        builder = builder.proxy(Proxy::http(proxy).context("Invalid http_proxy")?);
    }
    if let Some(proxy) = &settings.https_proxy {
        builder = builder.proxy(Proxy::https(proxy).context("Invalid https_proxy")?);
    }

    builder.build().context("Failed to build HTTP client")
}

/// Closed set of provider adapters, looked up by tag. Built once at startup
/// from settings; every adapter shares one HTTP client.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        let client = build_http_client(settings)?;
        let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        providers.insert(
            "openai".into(),
            Arc::new(openai::OpenAiCompatProvider::openai(settings, client.clone())),
        );
        providers.insert(
            "deepseek".into(),
            Arc::new(openai::OpenAiCompatProvider::deepseek(settings, client.clone())),
        );
        providers.insert(
            "anthropic".into(),
            Arc::new(anthropic::AnthropicProvider::new(settings, client.clone())),
        );
        providers.insert(
            "gemini".into(),
            Arc::new(gemini::GeminiProvider::new(settings, client)),
        );
        Ok(Self { providers })
    }

    /// Look up an adapter by tag. Unknown tags are a caller problem.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn ChatProvider>, GatewayError> {
        self.providers.get(name).ok_or_else(|| {
            let mut known: Vec<&str> = self.providers.keys().map(String::as_str).collect();
            known.sort_unstable();
            GatewayError::Client(format!(
                "Unknown provider: {}. Available providers: {:?}",
                name, known
            ))
        })
    }

    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_all_four_providers() {
        let registry = ProviderRegistry::from_settings(&AppSettings::default()).unwrap();
        assert_eq!(
            registry.provider_names(),
            vec!["anthropic", "deepseek", "gemini", "openai"]
        );
        assert!(registry.get("openai").is_ok());
        assert!(registry.get("anthropic").unwrap().supports_attachments());
        assert!(!registry.get("gemini").unwrap().supports_attachments());
    }

    #[test]
    fn unknown_provider_is_client_error() {
        let registry = ProviderRegistry::from_settings(&AppSettings::default()).unwrap();
        let err = registry.get("azure").unwrap_err();
        assert!(matches!(err, GatewayError::Client(_)));
        assert!(err.to_string().contains("Unknown provider"));
    }
}
