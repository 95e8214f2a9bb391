use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use serde_json::Value;
use tracing::error;

use crate::errors::GatewayError;

/// Shared upstream-failure classification for all provider adapters.
///
/// Every non-200 response and every transport failure goes through here and
/// comes out as a typed [`GatewayError`], so the failover loop never sees a
/// raw HTTP error.
pub struct ProviderErrorHandler;

impl ProviderErrorHandler {
    /// Parse a `Retry-After` header as whole seconds. Dates are not
    /// supported; an unparseable value is treated as absent.
    pub fn retry_after(headers: &HeaderMap) -> Option<u64> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|v| v.max(0.0) as u64)
    }

    /// Map a non-200 upstream response to the error taxonomy.
    pub fn classify(
        provider: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: &str,
    ) -> GatewayError {
        let code = status.as_u16();
        let summary = Self::error_summary(code, headers, body);
        error!("{} API error: {} - {}", provider, code, summary);

        if code == 429 {
            return GatewayError::RateLimit {
                retry_after: Self::retry_after(headers),
            };
        }
        if code >= 500 {
            // 5xx plus the Cloudflare sentinels 520-524
            return GatewayError::Transient(format!(
                "{} API server error ({}): {}",
                provider, code, summary
            ));
        }

        let lower = summary.to_lowercase();
        let looks_like_auth = code == 401
            || lower.contains("authentication")
            || (lower.contains("invalid") && lower.contains("api"));
        if looks_like_auth {
            return GatewayError::Auth(format!(
                "{} API authentication error: {}",
                provider, summary
            ));
        }

        GatewayError::Client(format!(
            "{} API client error ({}): {}",
            provider, code, summary
        ))
    }

    /// Map a reqwest transport failure (timeout, connect, body read) to the
    /// error taxonomy. Always transient: the upstream never answered.
    pub fn transport(provider: &str, err: &reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            error!("{} API request timed out", provider);
            GatewayError::Transient(format!("Request to {} API timed out", provider))
        } else {
            error!("{} API request error: {}", provider, err);
            GatewayError::Transient(format!("Failed to connect to {} API: {}", provider, err))
        }
    }

    /// Human-readable summary of an error body.
    ///
    /// HTML bodies (Cloudflare error pages and friends) are recognized and
    /// never parsed as JSON; the 52x sentinels get a canned description.
    fn error_summary(code: u16, headers: &HeaderMap, body: &str) -> String {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body_lower = body.to_lowercase();
        let is_html = content_type.starts_with("text/html")
            || ((520..=524).contains(&code)
                && (body_lower.contains("<html") || body_lower.contains("cloudflare")));

        if is_html {
            return match Self::cloudflare_description(code) {
                Some(desc) => desc.to_string(),
                None => format!("Origin server error {}: upstream returned an HTML page", code),
            };
        }

        if let Ok(json) = serde_json::from_str::<Value>(body) {
            let error = json.get("error").unwrap_or(&Value::Null);
            let error_type = error.get("type").and_then(Value::as_str).unwrap_or("");
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return if error_type.is_empty() {
                message.to_string()
            } else {
                format!("{}: {}", error_type, message)
            };
        }

        let mut text = body.to_string();
        if text.len() > 500 {
            text.truncate(500);
        }
        text
    }

    fn cloudflare_description(code: u16) -> Option<&'static str> {
        match code {
            520 => Some("Cloudflare Error 520: Origin server connection issue"),
            521 => Some("Cloudflare Error 521: Origin server refused connection"),
            522 => Some("Cloudflare Error 522: Connection timeout to origin server"),
            523 => Some("Cloudflare Error 523: Origin server unreachable"),
            524 => Some("Cloudflare Error 524: Timeout waiting for origin server"),
            _ => None,
        }
    }
}
