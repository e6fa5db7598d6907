use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::{ArchiveRecord, RecordStatus};
use crate::error::StateError;

/// Row as stored, before status and timestamp are parsed.
struct RawRecord {
    remote_id: String,
    name: String,
    local_path: String,
    size: i64,
    content_hash: String,
    status: String,
    trashed: bool,
    archived_at: String,
}

const SELECT_COLUMNS: &str =
    "SELECT remote_id, name, local_path, size, content_hash, status, trashed, archived_at
     FROM archive_records";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        remote_id: row.get(0)?,
        name: row.get(1)?,
        local_path: row.get(2)?,
        size: row.get(3)?,
        content_hash: row.get(4)?,
        status: row.get(5)?,
        trashed: row.get(6)?,
        archived_at: row.get(7)?,
    })
}

impl TryFrom<RawRecord> for ArchiveRecord {
    type Error = StateError;

    fn try_from(raw: RawRecord) -> Result<Self, StateError> {
        let status = RecordStatus::parse(&raw.status).ok_or_else(|| StateError::Corrupt {
            remote_id: raw.remote_id.clone(),
            reason: format!("unknown status '{}'", raw.status),
        })?;
        let archived_at = DateTime::parse_from_rfc3339(&raw.archived_at)
            .map_err(|e| StateError::Corrupt {
                remote_id: raw.remote_id.clone(),
                reason: format!("bad archived_at '{}': {}", raw.archived_at, e),
            })?
            .with_timezone(&Utc);

        Ok(ArchiveRecord {
            remote_id: raw.remote_id,
            name: raw.name,
            local_path: PathBuf::from(raw.local_path),
            size: raw.size.max(0) as u64,
            content_hash: raw.content_hash,
            status,
            trashed: raw.trashed,
            archived_at,
        })
    }
}

fn db_error(e: impl std::fmt::Display) -> StateError {
    StateError::Database(e.to_string())
}

/// Insert or replace the single record for `record.remote_id`.
pub async fn upsert(conn: &Connection, record: &ArchiveRecord) -> Result<(), StateError> {
    let record = record.clone();
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO archive_records
                (remote_id, name, local_path, size, content_hash, status, trashed, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(remote_id) DO UPDATE SET
                name = excluded.name,
                local_path = excluded.local_path,
                size = excluded.size,
                content_hash = excluded.content_hash,
                status = excluded.status,
                trashed = excluded.trashed,
                archived_at = excluded.archived_at,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &record.remote_id,
                &record.name,
                record.local_path.to_string_lossy().into_owned(),
                record.size as i64,
                &record.content_hash,
                record.status.as_str(),
                record.trashed,
                record.archived_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(db_error)
}

pub async fn get(conn: &Connection, remote_id: &str) -> Result<Option<ArchiveRecord>, StateError> {
    let remote_id = remote_id.to_string();
    let raw = conn
        .call(move |c| {
            c.query_row(
                &format!("{} WHERE remote_id = ?1", SELECT_COLUMNS),
                params![remote_id],
                read_row,
            )
            .optional()
        })
        .await
        .map_err(db_error)?;

    raw.map(ArchiveRecord::try_from).transpose()
}

pub async fn list(conn: &Connection) -> Result<Vec<ArchiveRecord>, StateError> {
    let rows = conn
        .call(|c| {
            let mut stmt = c.prepare(&format!("{} ORDER BY archived_at, remote_id", SELECT_COLUMNS))?;
            let rows = stmt
                .query_map([], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(db_error)?;

    rows.into_iter().map(ArchiveRecord::try_from).collect()
}

/// Ids whose archiving is complete. Trash-pending records are excluded.
pub async fn archived_ids(conn: &Connection) -> Result<HashSet<String>, StateError> {
    conn.call(|c| {
        let mut stmt =
            c.prepare("SELECT remote_id FROM archive_records WHERE status = 'Archived'")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok::<_, rusqlite::Error>(ids)
    })
    .await
    .map_err(db_error)
}

pub async fn is_archived(conn: &Connection, remote_id: &str) -> Result<bool, StateError> {
    let remote_id = remote_id.to_string();
    conn.call(move |c| {
        let count: i64 = c.query_row(
            "SELECT COUNT(*) FROM archive_records WHERE remote_id = ?1 AND status = 'Archived'",
            params![remote_id],
            |row| row.get(0),
        )?;
        Ok::<_, rusqlite::Error>(count > 0)
    })
    .await
    .map_err(db_error)
}

pub async fn remove(conn: &Connection, remote_id: &str) -> Result<bool, StateError> {
    let remote_id = remote_id.to_string();
    conn.call(move |c| {
        let n = c.execute(
            "DELETE FROM archive_records WHERE remote_id = ?1",
            params![remote_id],
        )?;
        Ok::<_, rusqlite::Error>(n > 0)
    })
    .await
    .map_err(db_error)
}

pub async fn clear(conn: &Connection) -> Result<usize, StateError> {
    conn.call(|c| {
        let n = c.execute("DELETE FROM archive_records", [])?;
        Ok::<_, rusqlite::Error>(n)
    })
    .await
    .map_err(db_error)
}
