//! Durable archive state.
//!
//! One row per remote file that has been archived (or whose local copy is in
//! place with the remote trash still pending). SQLite runs in WAL mode and
//! every write is a single transaction, so a crash never leaves a partial
//! record. All calls go through one `tokio-rusqlite` background thread, which
//! serializes writers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio_rusqlite::{Connection, rusqlite};
use tracing::debug;

use crate::core::{ArchiveRecord, RecordStatus};
use crate::error::StateError;

pub mod records;

/// Point-in-time view of the state store, read once before planning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub archived: HashSet<String>,
    /// Remote id -> local copy awaiting a successful trash.
    pub trash_pending: HashMap<String, PathBuf>,
}

impl StateSnapshot {
    pub fn is_archived(&self, remote_id: &str) -> bool {
        self.archived.contains(remote_id)
    }

    pub fn pending_local_copy(&self, remote_id: &str) -> Option<&PathBuf> {
        self.trash_pending.get(remote_id)
    }
}

/// Handle to the archive state database. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;
        debug!(path = %path.display(), "Opened state database");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StateError> {
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "FULL")?;

            let schema = include_str!("schema.sql");
            conn.execute_batch(schema)?;

            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        Ok(Self { conn })
    }

    /// True only for completed archives; trash-pending records don't count.
    pub async fn has(&self, remote_id: &str) -> Result<bool, StateError> {
        records::is_archived(&self.conn, remote_id).await
    }

    pub async fn record(&self, record: &ArchiveRecord) -> Result<(), StateError> {
        records::upsert(&self.conn, record).await?;
        debug!(
            remote_id = %record.remote_id,
            status = record.status.as_str(),
            "Archive record written"
        );
        Ok(())
    }

    pub async fn all(&self) -> Result<HashSet<String>, StateError> {
        records::archived_ids(&self.conn).await
    }

    pub async fn get(&self, remote_id: &str) -> Result<Option<ArchiveRecord>, StateError> {
        records::get(&self.conn, remote_id).await
    }

    pub async fn list(&self) -> Result<Vec<ArchiveRecord>, StateError> {
        records::list(&self.conn).await
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        let mut snapshot = StateSnapshot::default();
        for record in self.list().await? {
            match record.status {
                RecordStatus::Archived => {
                    snapshot.archived.insert(record.remote_id);
                }
                RecordStatus::TrashPending => {
                    snapshot
                        .trash_pending
                        .insert(record.remote_id, record.local_path);
                }
            }
        }
        Ok(snapshot)
    }

    /// Drop the record for one remote file so it is considered again.
    pub async fn forget(&self, remote_id: &str) -> Result<bool, StateError> {
        records::remove(&self.conn, remote_id).await
    }

    pub async fn clear(&self) -> Result<usize, StateError> {
        records::clear(&self.conn).await
    }
}
