use anyhow::{Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::Store;

/// Samples older than this are dropped on the next write for the key.
pub const RETENTION_SECONDS: i64 = 24 * 60 * 60;
/// Idle lists linger one extra hour past retention before the sweep
/// removes them entirely.
const TTL_GRACE_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSeriesPoint {
    /// Bucket start, ISO 8601 UTC with `Z` suffix.
    pub ts: String,
    pub tokens: u64,
}

/// Append-only per-key token usage samples with bucketised queries.
/// Lives in the shared store so the HTTP process and workers feed the same
/// series.
pub struct TokenTimeSeries {
    store: Arc<Store>,
}

impl TokenTimeSeries {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record one usage sample. Zero-token reports are dropped — they carry
    /// no signal and would only grow the list.
    pub fn record(&self, key_id: Uuid, tokens: u64, now: DateTime<Utc>) -> Result<()> {
        if tokens == 0 {
            debug!("skipping token recording for key {}: zero tokens", key_id);
            return Ok(());
        }

        let ts = now.timestamp();
        self.store.append_token_sample(key_id, ts, tokens)?;

        // Opportunistic retention: prune this key's old samples and sweep
        // lists idle past retention + grace
        let evicted = self.store.prune_token_samples(key_id, ts - RETENTION_SECONDS)?;
        self.store
            .expire_idle_token_lists(ts - RETENTION_SECONDS - TTL_GRACE_SECONDS)?;

        info!(
            "recorded {} tokens for key {} (evicted {} expired sample(s))",
            tokens, key_id, evicted
        );
        Ok(())
    }

    /// Bucketised series over the trailing window, aligned so "now" falls
    /// inside the last bucket. Always returns exactly
    /// `max(1, window_seconds / step_seconds)` points.
    pub fn query(
        &self,
        key_id: Uuid,
        window_minutes: u64,
        step_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>> {
        if step_seconds == 0 {
            bail!("step_seconds must be positive");
        }
        let step = step_seconds as i64;
        let window_seconds = (window_minutes * 60) as i64;
        let now_ts = now.timestamp();

        // Align up to the next step boundary so the last bucket contains now
        let end = (now_ts + step - 1) / step * step;
        let bucket_count = (window_seconds / step).max(1) as usize;
        let start = end - bucket_count as i64 * step;

        let mut buckets = vec![0u64; bucket_count];
        for (ts, tokens) in self.store.token_samples_since(key_id, start)? {
            let idx = (ts - start) / step;
            if idx < 0 {
                continue;
            }
            // Clock skew can land a sample past the aligned end; clamp it
            // into the last bucket rather than losing it
            let idx = (idx as usize).min(bucket_count - 1);
            buckets[idx] += tokens;
        }

        Ok(buckets
            .into_iter()
            .enumerate()
            .map(|(i, tokens)| TimeSeriesPoint {
                ts: format_bucket_ts(start + i as i64 * step),
                tokens,
            })
            .collect())
    }

    /// Keys with at least one retained sample. Debug introspection.
    pub fn keys_with_data(&self) -> Result<Vec<Uuid>> {
        self.store.token_sample_key_ids()
    }

    /// Retained sample count for one key. Debug introspection.
    pub fn sample_count(&self, key_id: Uuid) -> Result<u64> {
        self.store.token_sample_count(key_id)
    }
}

fn format_bucket_ts(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}
