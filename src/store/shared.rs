use anyhow::{Context, Result};
use rusqlite::params;
use uuid::Uuid;

use super::Store;

/// Shared-fast-store operations: the per-provider rotation cursor and the
/// per-key token sample lists. Both are written from every process, so they
/// live next to the relational tables in the WAL database rather than in
/// process memory.
impl Store {
    /// Atomically advance the per-provider round-robin cursor and return the
    /// pre-increment value (0 on first use). Persisting the cursor keeps
    /// rotation fair across HTTP/worker processes and restarts.
    pub fn next_rotation_index(&self, provider: &str) -> Result<u64> {
        let cursor: u64 = self
            .conn()
            .query_row(
                "INSERT INTO rotation_cursors (provider, cursor) VALUES (?1, 1) \
                 ON CONFLICT(provider) DO UPDATE SET cursor = cursor + 1 \
                 RETURNING cursor",
                params![provider],
                |row| row.get(0),
            )
            .context("Failed to advance rotation cursor")?;
        Ok(cursor - 1)
    }

    pub fn append_token_sample(&self, key_id: Uuid, ts: i64, tokens: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO token_samples (key_id, ts, tokens) VALUES (?1, ?2, ?3)",
            params![key_id.to_string(), ts, tokens],
        )?;
        Ok(())
    }

    /// Drop one key's samples older than `cutoff_ts`. Returns how many went.
    pub fn prune_token_samples(&self, key_id: Uuid, cutoff_ts: i64) -> Result<usize> {
        let evicted = self.conn().execute(
            "DELETE FROM token_samples WHERE key_id = ?1 AND ts < ?2",
            params![key_id.to_string(), cutoff_ts],
        )?;
        Ok(evicted)
    }

    /// TTL sweep: drop entire sample lists whose newest sample predates
    /// `cutoff_ts` (retention + grace). Mirrors a list-key expiry.
    pub fn expire_idle_token_lists(&self, cutoff_ts: i64) -> Result<usize> {
        let expired = self.conn().execute(
            "DELETE FROM token_samples WHERE key_id IN (
                 SELECT key_id FROM token_samples GROUP BY key_id HAVING MAX(ts) < ?1
             )",
            params![cutoff_ts],
        )?;
        Ok(expired)
    }

    /// `(ts, tokens)` pairs at or after `start_ts`, oldest first.
    pub fn token_samples_since(&self, key_id: Uuid, start_ts: i64) -> Result<Vec<(i64, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ts, tokens FROM token_samples WHERE key_id = ?1 AND ts >= ?2 ORDER BY ts",
        )?;
        let rows = stmt.query_map(params![key_id.to_string(), start_ts], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn token_sample_count(&self, key_id: Uuid) -> Result<u64> {
        let count: u64 = self.conn().query_row(
            "SELECT COUNT(*) FROM token_samples WHERE key_id = ?1",
            params![key_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn token_sample_key_ids(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT key_id FROM token_samples ORDER BY key_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for raw in rows {
            if let Ok(id) = Uuid::parse_str(&raw?) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
