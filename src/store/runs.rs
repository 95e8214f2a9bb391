use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Store, parse_utc, parse_utc_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => bail!("Unknown run status: {}", other),
        }
    }

    /// Terminal states never regress to non-terminal ones.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable asynchronous run record.
/// `input_messages` / `output_message` are stored as JSON, exactly as
/// received, so the worker can rebuild the chat request without the HTTP
/// layer's types.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub status: RunStatus,
    pub provider: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub input_messages: Value,
    pub output_message: Option<Value>,
    pub error: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error_reason: Option<String>,
}

const RUN_COLUMNS: &str = "id, status, provider, model, max_tokens, input_messages, \
     output_message, error, idempotency_key, created_at, updated_at, started_at, \
     finished_at, retry_count, last_error_reason";

const TERMINAL_GUARD: &str = "status NOT IN ('succeeded', 'failed', 'canceled')";

struct RawRunRow {
    id: String,
    status: String,
    provider: String,
    model: Option<String>,
    max_tokens: Option<u32>,
    input_messages: String,
    output_message: Option<String>,
    error: Option<String>,
    idempotency_key: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    retry_count: u32,
    last_error_reason: Option<String>,
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RawRunRow> {
    Ok(RawRunRow {
        id: row.get(0)?,
        status: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        max_tokens: row.get(4)?,
        input_messages: row.get(5)?,
        output_message: row.get(6)?,
        error: row.get(7)?,
        idempotency_key: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        started_at: row.get(11)?,
        finished_at: row.get(12)?,
        retry_count: row.get(13)?,
        last_error_reason: row.get(14)?,
    })
}

impl RawRunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: Uuid::parse_str(&self.id).context("Invalid run id in database")?,
            status: RunStatus::parse(&self.status)?,
            provider: self.provider,
            model: self.model,
            max_tokens: self.max_tokens,
            input_messages: serde_json::from_str(&self.input_messages)
                .context("Invalid input_messages JSON in database")?,
            output_message: self
                .output_message
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid output_message JSON in database")?,
            error: self.error,
            idempotency_key: self.idempotency_key,
            created_at: parse_utc(&self.created_at)?,
            updated_at: parse_utc(&self.updated_at)?,
            started_at: parse_utc_opt(self.started_at)?,
            finished_at: parse_utc_opt(self.finished_at)?,
            retry_count: self.retry_count,
            last_error_reason: self.last_error_reason,
        })
    }
}

impl Store {
    pub fn insert_run(
        &self,
        provider: &str,
        model: Option<&str>,
        max_tokens: Option<u32>,
        input_messages: &Value,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Run> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO runs (id, status, provider, model, max_tokens, input_messages, \
                 idempotency_key, created_at, updated_at, retry_count) \
                 VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0)",
                params![
                    id.to_string(),
                    provider,
                    model,
                    max_tokens,
                    serde_json::to_string(input_messages)?,
                    idempotency_key,
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to insert run")?;

        self.get_run(id)?
            .context("Inserted run not found on readback")
    }

    pub fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))?;
        let row = stmt
            .query_row(params![id.to_string()], run_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        row.map(RawRunRow::into_run).transpose()
    }

    pub fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE idempotency_key = ?1",
            RUN_COLUMNS
        ))?;
        let row = stmt
            .query_row(params![key], run_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        row.map(RawRunRow::into_run).transpose()
    }

    /// pending/running → queued (initial enqueue and retry re-enqueue).
    pub fn mark_run_queued(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE runs SET status = 'queued', updated_at = ?2 \
                 WHERE id = ?1 AND {}",
                TERMINAL_GUARD
            ),
            params![id.to_string(), now.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_run_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE runs SET status = 'running', started_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND {}",
                TERMINAL_GUARD
            ),
            params![id.to_string(), now.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Back to queued with retry bookkeeping, ahead of a delayed re-enqueue.
    pub fn mark_run_retrying(
        &self,
        id: Uuid,
        retry_count: u32,
        last_error_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE runs SET status = 'queued', retry_count = ?2, \
                 last_error_reason = ?3, updated_at = ?4 WHERE id = ?1 AND {}",
                TERMINAL_GUARD
            ),
            params![
                id.to_string(),
                retry_count,
                last_error_reason,
                now.to_rfc3339()
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_run_succeeded(
        &self,
        id: Uuid,
        output_message: &Value,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE runs SET status = 'succeeded', output_message = ?2, \
                 retry_count = ?3, finished_at = ?4, updated_at = ?4 \
                 WHERE id = ?1 AND {}",
                TERMINAL_GUARD
            ),
            params![
                id.to_string(),
                serde_json::to_string(output_message)?,
                retry_count,
                now.to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_run_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        last_error_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE runs SET status = 'failed', error = ?2, retry_count = ?3, \
                 last_error_reason = COALESCE(?4, last_error_reason), \
                 finished_at = ?5, updated_at = ?5 WHERE id = ?1 AND {}",
                TERMINAL_GUARD
            ),
            params![
                id.to_string(),
                error,
                retry_count,
                last_error_reason,
                now.to_rfc3339()
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_run_canceled(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE runs SET status = 'canceled', finished_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND {}",
                TERMINAL_GUARD
            ),
            params![id.to_string(), now.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }
}
