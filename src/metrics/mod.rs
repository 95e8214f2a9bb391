use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::errors::ErrorKind;

/// Per-provider request outcome counts, served by `/v1/stats/providers`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProviderRequestCounts {
    pub success: u64,
    pub error: u64,
}

/// Process-wide counters. Plain mutex-guarded maps — reset on restart,
/// which is fine for an operational at-a-glance surface.
#[derive(Debug, Default)]
pub struct RequestCounters {
    requests: Mutex<HashMap<String, ProviderRequestCounts>>,
    key_errors: Mutex<HashMap<(String, &'static str), u64>>,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, provider: &str, success: bool) {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let counts = requests.entry(provider.to_string()).or_default();
        if success {
            counts.success += 1;
        } else {
            counts.error += 1;
        }
    }

    pub fn record_key_error(&self, provider: &str, kind: ErrorKind) {
        let mut key_errors = self
            .key_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *key_errors
            .entry((provider.to_string(), kind.as_str()))
            .or_default() += 1;
    }

    pub fn request_counts(&self) -> HashMap<String, ProviderRequestCounts> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `provider -> kind -> count`, shaped for JSON output.
    pub fn key_error_counts(&self) -> HashMap<String, HashMap<&'static str, u64>> {
        let key_errors = self
            .key_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut out: HashMap<String, HashMap<&'static str, u64>> = HashMap::new();
        for ((provider, kind), count) in key_errors.iter() {
            out.entry(provider.clone()).or_default().insert(*kind, *count);
        }
        out
    }
}
