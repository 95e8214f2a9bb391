use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Store, parse_utc, parse_utc_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    CoolingDown,
    Disabled,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::CoolingDown => "cooling_down",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "cooling_down" => Ok(Self::CoolingDown),
            "disabled" => Ok(Self::Disabled),
            other => bail!("Unknown key status: {}", other),
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider credential with its health state. Health fields (`status`,
/// `cooling_until`, `error_count_recent`, `last_*_at`) are mutated by the
/// key pool during normal operation; everything else via the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderKey {
    pub id: Uuid,
    pub provider: String,
    pub display_name: String,
    pub api_key: String,
    pub environment: String,
    pub max_rpm: Option<u32>,
    /// Reserved — accepted and stored, not yet enforced.
    pub max_tpm: Option<u32>,
    pub priority: i64,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_count_recent: i64,
    pub cooling_until: Option<DateTime<Utc>>,
}

impl ProviderKey {
    /// A key is usable when it is not disabled and any cooling period has
    /// elapsed. `decay_errors` flips the persisted status lazily; this check
    /// must not trust it alone.
    pub fn effectively_active(&self, now: DateTime<Utc>) -> bool {
        if self.status == KeyStatus::Disabled {
            return false;
        }
        match self.cooling_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}

fn default_environment() -> String {
    "prod".to_string()
}

fn default_priority() -> i64 {
    100
}

fn default_status() -> KeyStatus {
    KeyStatus::Active
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewKey {
    pub provider: String,
    pub display_name: String,
    pub api_key: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub max_rpm: Option<u32>,
    #[serde(default)]
    pub max_tpm: Option<u32>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_status")]
    pub status: KeyStatus,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyUpdate {
    pub provider: Option<String>,
    pub display_name: Option<String>,
    pub api_key: Option<String>,
    pub environment: Option<String>,
    pub max_rpm: Option<u32>,
    pub max_tpm: Option<u32>,
    pub priority: Option<i64>,
    pub status: Option<KeyStatus>,
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<RawKeyRow> {
    Ok(RawKeyRow {
        id: row.get(0)?,
        provider: row.get(1)?,
        display_name: row.get(2)?,
        api_key: row.get(3)?,
        environment: row.get(4)?,
        max_rpm: row.get(5)?,
        max_tpm: row.get(6)?,
        priority: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        last_used_at: row.get(11)?,
        last_error_at: row.get(12)?,
        error_count_recent: row.get(13)?,
        cooling_until: row.get(14)?,
    })
}

struct RawKeyRow {
    id: String,
    provider: String,
    display_name: String,
    api_key: String,
    environment: String,
    max_rpm: Option<u32>,
    max_tpm: Option<u32>,
    priority: i64,
    status: String,
    created_at: String,
    updated_at: String,
    last_used_at: Option<String>,
    last_error_at: Option<String>,
    error_count_recent: i64,
    cooling_until: Option<String>,
}

impl RawKeyRow {
    fn into_key(self) -> Result<ProviderKey> {
        Ok(ProviderKey {
            id: Uuid::parse_str(&self.id).context("Invalid key id in database")?,
            provider: self.provider,
            display_name: self.display_name,
            api_key: self.api_key,
            environment: self.environment,
            max_rpm: self.max_rpm,
            max_tpm: self.max_tpm,
            priority: self.priority,
            status: KeyStatus::parse(&self.status)?,
            created_at: parse_utc(&self.created_at)?,
            updated_at: parse_utc(&self.updated_at)?,
            last_used_at: parse_utc_opt(self.last_used_at)?,
            last_error_at: parse_utc_opt(self.last_error_at)?,
            error_count_recent: self.error_count_recent,
            cooling_until: parse_utc_opt(self.cooling_until)?,
        })
    }
}

const KEY_COLUMNS: &str = "id, provider, display_name, api_key, environment, max_rpm, max_tpm, \
     priority, status, created_at, updated_at, last_used_at, last_error_at, \
     error_count_recent, cooling_until";

impl Store {
    pub fn insert_key(&self, new: &NewKey, now: DateTime<Utc>) -> Result<ProviderKey> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO provider_keys (id, provider, display_name, api_key, environment, \
                 max_rpm, max_tpm, priority, status, created_at, updated_at, error_count_recent) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 0)",
                params![
                    id.to_string(),
                    new.provider,
                    new.display_name,
                    new.api_key,
                    new.environment,
                    new.max_rpm,
                    new.max_tpm,
                    new.priority,
                    new.status.as_str(),
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to insert provider key")?;

        self.get_key(id)?
            .context("Inserted key not found on readback")
    }

    pub fn get_key(&self, id: Uuid) -> Result<Option<ProviderKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM provider_keys WHERE id = ?1",
            KEY_COLUMNS
        ))?;
        let row = stmt
            .query_row(params![id.to_string()], key_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        row.map(RawKeyRow::into_key).transpose()
    }

    /// Admin listing, sorted by `(priority, created_at)`.
    pub fn list_keys(
        &self,
        provider: Option<&str>,
        status: Option<KeyStatus>,
    ) -> Result<Vec<ProviderKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM provider_keys \
             WHERE (?1 IS NULL OR provider = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY priority, created_at",
            KEY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![provider, status.map(KeyStatus::as_str)], key_from_row)?;
        rows.map(|r| r.map_err(anyhow::Error::from).and_then(RawKeyRow::into_key))
            .collect()
    }

    /// Keys the pool may consider: everything for the provider except
    /// disabled keys. Cooling keys are included — the pool decides.
    pub fn list_selectable_keys(&self, provider: &str) -> Result<Vec<ProviderKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM provider_keys WHERE provider = ?1 AND status != 'disabled'",
            KEY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![provider], key_from_row)?;
        rows.map(|r| r.map_err(anyhow::Error::from).and_then(RawKeyRow::into_key))
            .collect()
    }

    pub fn update_key(
        &self,
        id: Uuid,
        update: &KeyUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ProviderKey>> {
        let Some(existing) = self.get_key(id)? else {
            return Ok(None);
        };

        let changed = self.conn().execute(
            "UPDATE provider_keys SET provider = ?2, display_name = ?3, api_key = ?4, \
             environment = ?5, max_rpm = ?6, max_tpm = ?7, priority = ?8, status = ?9, \
             updated_at = ?10 WHERE id = ?1",
            params![
                id.to_string(),
                update.provider.as_deref().unwrap_or(&existing.provider),
                update
                    .display_name
                    .as_deref()
                    .unwrap_or(&existing.display_name),
                update.api_key.as_deref().unwrap_or(&existing.api_key),
                update
                    .environment
                    .as_deref()
                    .unwrap_or(&existing.environment),
                update.max_rpm.or(existing.max_rpm),
                update.max_tpm.or(existing.max_tpm),
                update.priority.unwrap_or(existing.priority),
                update.status.unwrap_or(existing.status).as_str(),
                now.to_rfc3339(),
            ],
        )?;
        debug_assert_eq!(changed, 1);

        self.get_key(id)
    }

    pub fn delete_key(&self, id: Uuid) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM provider_keys WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    /// Single-row health write used by the pool. Last write wins; readers
    /// tolerate slightly stale state because decay fixes it on the next read.
    pub fn save_key_health(&self, key: &ProviderKey, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE provider_keys SET status = ?2, cooling_until = ?3, \
             error_count_recent = ?4, last_error_at = ?5, updated_at = ?6 WHERE id = ?1",
            params![
                key.id.to_string(),
                key.status.as_str(),
                key.cooling_until.map(|t| t.to_rfc3339()),
                key.error_count_recent,
                key.last_error_at.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn save_key_last_used(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE provider_keys SET last_used_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        Ok(())
    }
}
