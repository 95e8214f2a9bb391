use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppSettings;
use crate::errors::ErrorKind;
use crate::metrics::RequestCounters;
use crate::store::{KeyStatus, ProviderKey, Store};

/// Per-key sliding RPM window. Strictly per-process state: each process
/// admits up to `max_rpm` on its own, a documented imprecision. Lost on
/// restart and re-learned within one window.
#[derive(Debug, Clone, Copy)]
struct RpmWindow {
    window_start: DateTime<Utc>,
    count: u32,
}

/// Health-aware credential selection for one provider's key pool.
///
/// Scoring is a total order on `(error_count_recent, priority, created_at)`;
/// the persisted round-robin cursor then rotates over the whole sorted
/// candidate list, so better keys are chosen more often without starving
/// backups. Strict top-key selection would never exercise them.
pub struct KeyPool {
    store: Arc<Store>,
    settings: Arc<AppSettings>,
    counters: Arc<RequestCounters>,
    rpm: Mutex<HashMap<Uuid, RpmWindow>>,
}

impl KeyPool {
    pub fn new(
        store: Arc<Store>,
        settings: Arc<AppSettings>,
        counters: Arc<RequestCounters>,
    ) -> Self {
        Self {
            store,
            settings,
            counters,
            rpm: Mutex::new(HashMap::new()),
        }
    }

    /// Pick the best usable key for `provider`, or `None` if the pool is
    /// exhausted right now. Keys in `excluded` were already tried in this
    /// request/attempt and are never returned again.
    pub fn select(
        &self,
        provider: &str,
        now: DateTime<Utc>,
        excluded: &HashSet<Uuid>,
    ) -> Result<Option<ProviderKey>> {
        let keys = self.store.list_selectable_keys(provider)?;
        if keys.is_empty() {
            return Ok(None);
        }

        let mut available = Vec::with_capacity(keys.len());
        for mut key in keys {
            // Opportunistic cleanup — stale error counts and expired cooling
            // are fixed on read rather than by a background task.
            self.decay_errors(&mut key, now)?;

            if excluded.contains(&key.id) {
                debug!("key {} ({}) excluded (already tried)", key.display_name, key.id);
                continue;
            }
            if !key.effectively_active(now) {
                debug!(
                    "key {} ({}) not effectively active: status={}, cooling_until={:?}",
                    key.display_name, key.id, key.status, key.cooling_until
                );
                continue;
            }
            if !self.can_use_for_rpm(&key, now) {
                debug!("key {} ({}) over its RPM limit", key.display_name, key.id);
                continue;
            }
            available.push(key);
        }

        if available.is_empty() {
            return Ok(None);
        }

        available.sort_by_key(|k| (k.error_count_recent, k.priority, k.created_at.timestamp()));

        let candidates = available.len();
        let cursor = self.store.next_rotation_index(provider)?;
        let index = (cursor % candidates as u64) as usize;
        let selected = available.swap_remove(index);
        debug!(
            "selected key for {}: {} ({}) [round-robin index {} of {}]",
            provider, selected.display_name, selected.id, index, candidates
        );

        Ok(Some(selected))
    }

    /// RPM admission check. No limit configured → always admitted.
    pub fn can_use_for_rpm(&self, key: &ProviderKey, now: DateTime<Utc>) -> bool {
        let Some(max_rpm) = key.max_rpm else {
            return true;
        };

        let width = self.window_width();
        let mut rpm = self.rpm.lock().unwrap_or_else(PoisonError::into_inner);
        let window = rpm.entry(key.id).or_insert(RpmWindow {
            window_start: now,
            count: 0,
        });

        if now - window.window_start >= width {
            window.window_start = now;
            window.count = 0;
            return true;
        }
        window.count < max_rpm
    }

    /// Count one request against the key's window.
    pub fn register_usage(&self, key: &ProviderKey, now: DateTime<Utc>) {
        let width = self.window_width();
        let mut rpm = self.rpm.lock().unwrap_or_else(PoisonError::into_inner);
        let window = rpm.entry(key.id).or_insert(RpmWindow {
            window_start: now,
            count: 0,
        });

        if now - window.window_start >= width {
            window.window_start = now;
            window.count = 1;
        } else {
            window.count += 1;
        }
    }

    /// Record an upstream failure against the key and apply the per-kind
    /// consequence: cooling for rate limits and transient errors, permanent
    /// disable for authentication failures, nothing for client errors.
    pub fn mark_error(
        &self,
        key: &mut ProviderKey,
        now: DateTime<Utc>,
        kind: ErrorKind,
    ) -> Result<()> {
        key.error_count_recent += 1;
        key.last_error_at = Some(now);

        match kind {
            ErrorKind::RateLimit => {
                key.cooling_until =
                    Some(now + Duration::seconds(self.settings.key_cooldown_seconds_on_429 as i64));
                key.status = KeyStatus::CoolingDown;
            }
            ErrorKind::Transient => {
                key.cooling_until = Some(
                    now + Duration::seconds(
                        self.settings.key_cooldown_seconds_on_network_error as i64,
                    ),
                );
                key.status = KeyStatus::CoolingDown;
            }
            ErrorKind::Authentication => {
                // Dead credential: out of rotation until an admin re-enables it
                key.status = KeyStatus::Disabled;
                key.cooling_until = None;
            }
            ErrorKind::Client => {
                // Caller problem, not the key's — counted but never cooled
            }
        }

        warn!(
            "key {} ({}) marked with {} error (count {})",
            key.display_name,
            key.id,
            kind.as_str(),
            key.error_count_recent
        );
        self.counters.record_key_error(&key.provider, kind);
        self.store.save_key_health(key, now)?;
        Ok(())
    }

    /// Reset stale error counts and lift expired cooling. Idempotent; safe
    /// to apply on every read.
    pub fn decay_errors(&self, key: &mut ProviderKey, now: DateTime<Utc>) -> Result<()> {
        let mut dirty = false;

        if let Some(last_error_at) = key.last_error_at {
            let decay = Duration::minutes(self.settings.key_error_decay_minutes as i64);
            if now - last_error_at >= decay && key.error_count_recent != 0 {
                key.error_count_recent = 0;
                dirty = true;
            }
        }

        if key.status == KeyStatus::CoolingDown {
            let expired = match key.cooling_until {
                Some(until) => until <= now,
                None => true,
            };
            if expired {
                info!("key {} ({}) cooled off, reactivating", key.display_name, key.id);
                key.status = KeyStatus::Active;
                key.cooling_until = None;
                dirty = true;
            }
        }

        if dirty {
            self.store.save_key_health(key, now)?;
        }
        Ok(())
    }

    /// Persist `last_used_at` after a successful upstream call.
    pub fn update_usage(&self, key: &ProviderKey, now: DateTime<Utc>) -> Result<()> {
        self.store.save_key_last_used(key.id, now)
    }

    fn window_width(&self) -> Duration {
        Duration::seconds(self.settings.key_rpm_window_seconds as i64)
    }
}
