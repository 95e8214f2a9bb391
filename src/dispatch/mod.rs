use chrono::Utc;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{ErrorKind, GatewayError};
use crate::metrics::RequestCounters;
use crate::pool::KeyPool;
use crate::providers::base::{ChatRequest, ChatResponse, StoredFiles};
use crate::providers::ProviderRegistry;
use crate::timeseries::TokenTimeSeries;

#[derive(Debug)]
pub struct DispatchSuccess {
    pub response: ChatResponse,
    pub key_id: Uuid,
    /// Upstream attempts consumed, including the successful one.
    pub attempts: u32,
}

/// Terminal outcome of a failover loop that did not produce a response.
#[derive(Debug)]
pub enum DispatchError {
    /// Attempt budget exhausted and the last failure was a rate limit.
    /// Carries the largest Retry-After hint observed across the loop.
    RateLimited { retry_after: Option<u64> },
    /// Attempt budget exhausted on transient or authentication failures.
    Unavailable { last_error: String },
    /// No key was selectable when one was needed.
    NoKeys { provider: String },
    /// Non-retriable upstream rejection; failing fast was correct.
    Client { message: String },
    /// Gateway-side failure (store, registry plumbing).
    Internal(anyhow::Error),
}

impl DispatchError {
    /// Whether a later attempt (the worker's delayed re-enqueue) could
    /// plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::NoKeys { .. } => true,
            Self::Client { .. } | Self::Internal(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short reason for run bookkeeping (`last_error_reason`).
    pub fn summary(&self) -> String {
        match self {
            Self::RateLimited { .. } => "Rate limit: all keys exhausted".into(),
            Self::Unavailable { last_error } => format!("Transient error: {}", last_error),
            Self::NoKeys { .. } => "No available keys".into(),
            Self::Client { message } => format!("Client error: {}", message),
            Self::Internal(e) => format!("Internal error: {}", e),
        }
    }
}

/// The failover loop shared by the sync chat path and the async worker:
/// select the best key, call upstream, classify the failure, cool or
/// disable the key, move on to the next one. No sleeps between attempts —
/// each attempt uses a different key.
pub async fn dispatch_with_failover(
    pool: &KeyPool,
    registry: &ProviderRegistry,
    timeseries: &TokenTimeSeries,
    counters: &RequestCounters,
    provider_name: &str,
    request: &ChatRequest,
    stored_files: Option<&StoredFiles>,
    max_attempts: u32,
) -> Result<DispatchSuccess, DispatchError> {
    let provider = match registry.get(provider_name) {
        Ok(provider) => provider,
        Err(err) => {
            counters.record_request(provider_name, false);
            return Err(DispatchError::Client {
                message: err.to_string(),
            });
        }
    };

    let mut excluded: HashSet<Uuid> = HashSet::new();
    let mut last_error: Option<GatewayError> = None;
    let mut max_retry_after: Option<u64> = None;

    for attempt in 1..=max_attempts {
        let now = Utc::now();
        let selected = pool
            .select(provider_name, now, &excluded)
            .map_err(DispatchError::Internal)?;
        let Some(mut key) = selected else {
            break;
        };
        excluded.insert(key.id);
        info!(
            "attempt {}/{} with key {} ({}) for provider {}",
            attempt, max_attempts, key.display_name, key.id, provider_name
        );

        pool.decay_errors(&mut key, now).map_err(DispatchError::Internal)?;
        pool.register_usage(&key, now);
        pool.update_usage(&key, now).map_err(DispatchError::Internal)?;

        match provider.chat(&key.api_key, request, stored_files).await {
            Ok(response) => {
                let now = Utc::now();
                // Promote a key whose cooling expired mid-flight
                pool.decay_errors(&mut key, now).map_err(DispatchError::Internal)?;
                counters.record_request(provider_name, true);

                if let Some(usage) = &response.usage {
                    let total = usage.total_or_sum();
                    if total > 0 {
                        timeseries
                            .record(key.id, total, now)
                            .map_err(DispatchError::Internal)?;
                    } else {
                        warn!("no tokens to record for key {}", key.id);
                    }
                } else {
                    warn!(
                        "no usage data in response for key {} (provider: {})",
                        key.id, provider_name
                    );
                }

                pool.update_usage(&key, now).map_err(DispatchError::Internal)?;
                return Ok(DispatchSuccess {
                    response,
                    key_id: key.id,
                    attempts: attempt,
                });
            }
            Err(err) => match err.kind() {
                Some(ErrorKind::Client) => {
                    pool.mark_error(&mut key, now, ErrorKind::Client)
                        .map_err(DispatchError::Internal)?;
                    counters.record_request(provider_name, false);
                    return Err(DispatchError::Client {
                        message: err.to_string(),
                    });
                }
                Some(kind) => {
                    if let Some(hint) = err.retry_after() {
                        max_retry_after = Some(max_retry_after.unwrap_or(0).max(hint));
                    }
                    pool.mark_error(&mut key, now, kind)
                        .map_err(DispatchError::Internal)?;
                    warn!(
                        "attempt {}/{} failed with {} error: {}",
                        attempt,
                        max_attempts,
                        kind.as_str(),
                        err
                    );
                    last_error = Some(err);
                }
                None => {
                    counters.record_request(provider_name, false);
                    return Err(DispatchError::Internal(err.into()));
                }
            },
        }
    }

    counters.record_request(provider_name, false);
    match last_error {
        Some(GatewayError::RateLimit { .. }) => Err(DispatchError::RateLimited {
            retry_after: max_retry_after,
        }),
        Some(err) => Err(DispatchError::Unavailable {
            last_error: err.to_string(),
        }),
        None => Err(DispatchError::NoKeys {
            provider: provider_name.to_string(),
        }),
    }
}
