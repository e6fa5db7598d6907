use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ErrorClass;

/// Typed snapshot of one remote file, populated once at the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub owned_by_me: bool,
    /// False for shared-with-me and shared-drive items.
    pub in_primary_drive: bool,
    pub modified_time: Option<DateTime<Utc>>,
    pub created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Photo,
    Video,
    Audio,
    Document,
    Archive,
    Installer,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Photo,
        Category::Video,
        Category::Audio,
        Category::Document,
        Category::Archive,
        Category::Installer,
        Category::Other,
    ];

    pub fn folder_name(&self) -> &'static str {
        match self {
            Self::Photo => "Photos",
            Self::Video => "Videos",
            Self::Audio => "Audio",
            Self::Document => "Documents",
            Self::Archive => "Archives",
            Self::Installer => "Installers",
            Self::Other => "Other",
        }
    }

    /// Whether archived files get `<YYYY>/<YYYY-MM>` subfolders.
    pub fn is_date_partitioned(&self) -> bool {
        matches!(self, Self::Photo | Self::Video | Self::Document)
    }
}

/// Target format for native documents that must be exported rather than downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub mime_type: String,
    /// Includes the leading dot, e.g. ".docx"
    pub extension: String,
}

/// Which timestamp the organizer used to place a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampSource {
    Modified,
    Created,
    RunStarted,
}

/// One unit of executor work. Built by the planner, consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub remote_id: String,
    pub name: String,
    /// Remote-reported size; `None` for exported native documents.
    pub expected_size: Option<u64>,
    pub mime_type: String,
    pub category: Category,
    pub export: Option<ExportSpec>,
    pub destination: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    /// Local copy from an earlier run whose trash step never completed.
    pub resume: Option<PathBuf>,
    pub modified_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Archived,
    /// Local copy is in place, remote trash has not succeeded yet.
    TrashPending,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archived => "Archived",
            Self::TrashPending => "TrashPending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Archived" => Some(Self::Archived),
            "TrashPending" => Some(Self::TrashPending),
            _ => None,
        }
    }
}

/// Persisted proof that a remote file has been archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveRecord {
    pub remote_id: String,
    pub name: String,
    pub local_path: PathBuf,
    pub size: u64,
    /// BLAKE3 of the archived bytes, hex encoded
    pub content_hash: String,
    pub status: RecordStatus,
    pub trashed: bool,
    pub archived_at: DateTime<Utc>,
}

/// Per-item lifecycle states. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Pending,
    Downloading,
    Verifying,
    Relocating,
    TrashPending,
    Done,
    Failed,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemStatus {
    Archived,
    /// Dry-run result: nothing was touched.
    WouldArchive,
    Failed,
    /// Not attempted, e.g. the run was cancelled first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub class: ErrorClass,
    /// Calm, user-facing text.
    pub message: String,
    /// Internal detail for logs.
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub remote_id: String,
    pub name: String,
    pub category: Category,
    pub destination: Option<PathBuf>,
    pub status: ItemStatus,
    /// Last state reached before the outcome was decided.
    pub last_state: ItemState,
    pub trashed: bool,
    pub error: Option<ItemError>,
}

/// Aggregate report for one pipeline execution. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub eligible: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl RunResult {
    pub fn from_outcomes(
        run_id: String,
        started_at: DateTime<Utc>,
        dry_run: bool,
        outcomes: Vec<ItemOutcome>,
    ) -> Self {
        let mut succeeded = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for outcome in &outcomes {
            match outcome.status {
                ItemStatus::Archived | ItemStatus::WouldArchive => succeeded += 1,
                ItemStatus::Skipped => skipped += 1,
                ItemStatus::Failed => failed += 1,
            }
        }

        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            eligible: outcomes.len(),
            succeeded,
            skipped,
            failed,
            outcomes,
        }
    }
}
