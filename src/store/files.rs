use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::{Store, parse_utc};

/// An uploaded file referenced by chat attachments. Upload and retrieval
/// live outside the gateway core; this record is only consumed when
/// building multimodal provider requests.
#[derive(Debug, Clone, Serialize)]
pub struct StoredFileRecord {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, u64, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl Store {
    pub fn insert_stored_file(
        &self,
        filename: &str,
        mime_type: &str,
        size_bytes: u64,
        storage_path: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredFileRecord> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO stored_files (id, filename, mime_type, size_bytes, storage_path, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    filename,
                    mime_type,
                    size_bytes,
                    storage_path,
                    now.to_rfc3339()
                ],
            )
            .context("Failed to insert stored file")?;

        Ok(StoredFileRecord {
            id,
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes,
            storage_path: storage_path.to_string(),
            created_at: now,
        })
    }

    pub fn get_stored_file(&self, id: Uuid) -> Result<Option<StoredFileRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, filename, mime_type, size_bytes, storage_path, created_at \
             FROM stored_files WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![id.to_string()], file_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        row.map(|(id, filename, mime_type, size_bytes, storage_path, created_at)| {
            Ok(StoredFileRecord {
                id: Uuid::parse_str(&id).context("Invalid file id in database")?,
                filename,
                mime_type,
                size_bytes,
                storage_path,
                created_at: parse_utc(&created_at)?,
            })
        })
        .transpose()
    }

    /// Resolve a set of attachment file ids. Malformed ids are skipped with
    /// a warning; missing files are simply absent from the result — the
    /// caller decides whether that is an error.
    pub fn get_stored_files(&self, ids: &[String]) -> Result<Vec<StoredFileRecord>> {
        let mut found = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = Uuid::parse_str(raw) else {
                warn!("invalid file_id format: {}", raw);
                continue;
            };
            if let Some(record) = self.get_stored_file(id)? {
                found.push(record);
            }
        }
        Ok(found)
    }
}
