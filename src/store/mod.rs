use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod files;
mod jobs;
mod keys;
mod runs;
mod shared;

pub use files::StoredFileRecord;
pub use jobs::QueuedJob;
pub use keys::{KeyStatus, KeyUpdate, NewKey, ProviderKey};
pub use runs::{Run, RunStatus};

/// All gateway persistence behind one WAL `SQLite` database: the relational
/// tables (provider keys, runs, stored files) plus the shared fast store
/// (rotation cursors, token samples, the delayed job queue). The same file is
/// opened by the HTTP process and the workers; WAL mode plus a busy timeout
/// keeps concurrent single-row writes safe.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create database parent directory: {}",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set database PRAGMAs")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS provider_keys (
                 id TEXT PRIMARY KEY,
                 provider TEXT NOT NULL,
                 display_name TEXT NOT NULL,
                 api_key TEXT NOT NULL,
                 environment TEXT NOT NULL DEFAULT 'prod',
                 max_rpm INTEGER,
                 max_tpm INTEGER,
                 priority INTEGER NOT NULL DEFAULT 100,
                 status TEXT NOT NULL DEFAULT 'active',
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 last_used_at TEXT,
                 last_error_at TEXT,
                 error_count_recent INTEGER NOT NULL DEFAULT 0,
                 cooling_until TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_provider_keys_provider
                 ON provider_keys(provider);

             CREATE TABLE IF NOT EXISTS runs (
                 id TEXT PRIMARY KEY,
                 status TEXT NOT NULL DEFAULT 'pending',
                 provider TEXT NOT NULL,
                 model TEXT,
                 max_tokens INTEGER,
                 input_messages TEXT NOT NULL,
                 output_message TEXT,
                 error TEXT,
                 idempotency_key TEXT UNIQUE,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 started_at TEXT,
                 finished_at TEXT,
                 retry_count INTEGER NOT NULL DEFAULT 0,
                 last_error_reason TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_runs_status_created
                 ON runs(status, created_at);

             CREATE TABLE IF NOT EXISTS stored_files (
                 id TEXT PRIMARY KEY,
                 filename TEXT NOT NULL,
                 mime_type TEXT NOT NULL,
                 size_bytes INTEGER NOT NULL,
                 storage_path TEXT NOT NULL UNIQUE,
                 created_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS rotation_cursors (
                 provider TEXT PRIMARY KEY,
                 cursor INTEGER NOT NULL DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS token_samples (
                 key_id TEXT NOT NULL,
                 ts INTEGER NOT NULL,
                 tokens INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_token_samples_key_ts
                 ON token_samples(key_id, ts);

             CREATE TABLE IF NOT EXISTS jobs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 attempt INTEGER NOT NULL DEFAULT 1,
                 available_at TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_jobs_available
                 ON jobs(available_at);",
        )
        .context("Failed to initialize database schema")?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse a persisted timestamp. RFC 3339 values keep their offset (converted
/// to UTC); naive values are promoted to UTC rather than rejected.
pub(crate) fn parse_utc(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("Unparseable timestamp: {}", s))?;
    Ok(naive.and_utc())
}

pub(crate) fn parse_utc_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_utc).transpose()
}

#[cfg(test)]
mod tests;
