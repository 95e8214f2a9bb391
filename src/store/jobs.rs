use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{Store, parse_utc};

/// A claimed queue entry: which run to process and which attempt this is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub run_id: Uuid,
    pub attempt: u32,
}

impl Store {
    /// Durable enqueue. `available_at` in the future is a delayed enqueue;
    /// the job stays invisible to `claim_due_job` until then.
    pub fn enqueue_job(
        &self,
        run_id: Uuid,
        attempt: u32,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO jobs (run_id, attempt, available_at, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id.to_string(),
                attempt,
                available_at.to_rfc3339(),
                now.to_rfc3339()
            ],
        )
        .context("Failed to enqueue job")?;
        Ok(conn.last_insert_rowid())
    }

    /// Remove and return the earliest due job, if any. Delete-and-return in
    /// one statement so two workers polling the same database cannot claim
    /// the same job.
    pub fn claim_due_job(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let row = self
            .conn()
            .query_row(
                "DELETE FROM jobs WHERE id = (
                     SELECT id FROM jobs WHERE available_at <= ?1
                     ORDER BY available_at, id LIMIT 1
                 ) RETURNING run_id, attempt",
                params![now.to_rfc3339()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        row.map(|(run_id, attempt)| {
            Ok(QueuedJob {
                run_id: Uuid::parse_str(&run_id).context("Invalid run id in job queue")?,
                attempt,
            })
        })
        .transpose()
    }

    /// Pending jobs with their due times, soonest first. Debug/test aid.
    pub fn pending_jobs(&self) -> Result<Vec<(Uuid, u32, DateTime<Utc>)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT run_id, attempt, available_at FROM jobs ORDER BY available_at, id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        rows.map(|r| {
            let (run_id, attempt, available_at) = r?;
            Ok((
                Uuid::parse_str(&run_id).context("Invalid run id in job queue")?,
                attempt,
                parse_utc(&available_at)?,
            ))
        })
        .collect()
    }
}
