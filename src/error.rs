//! Error taxonomy for the archive pipeline.
//!
//! Three layers:
//! - [`StorageError`]: the closed set of failures the remote store can report.
//! - [`ArchiveError`]: a failure scoped to one work item.
//! - [`PipelineError`]: a failure that aborts the whole run.
//!
//! Internal detail stays in `Display` for logs; anything shown to a person goes
//! through `user_message()`.

use serde::Serialize;
use std::io::{self, ErrorKind};
use thiserror::Error;

/// Failures reported by a [`crate::core::StorageClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient remote error: {0}")]
    Transient(String),
    #[error("remote error: {0}")]
    Fatal(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

/// Coarse class of an item failure, reported in outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    Transient,
    Fatal,
    Integrity,
}

/// What kind of non-retryable failure stopped an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatalKind {
    Unauthorized,
    NotFound,
    DiskFull,
    PermissionDenied,
    Filesystem,
    Remote,
    StateStore,
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not found",
            Self::DiskFull => "disk full",
            Self::PermissionDenied => "permission denied",
            Self::Filesystem => "filesystem error",
            Self::Remote => "remote error",
            Self::StateStore => "state store error",
        };
        f.write_str(s)
    }
}

/// A failure scoped to a single work item.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("{kind}: {message}")]
    Fatal { kind: FatalKind, message: String },
    #[error("verification failed: {0}")]
    Integrity(String),
    #[error("cancelled")]
    Cancelled,
}

impl ArchiveError {
    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }

    /// Classify a local I/O error. Filesystem errors are never retried.
    pub fn from_io(context: &str, error: &io::Error) -> Self {
        let kind = if is_disk_full_error(error) {
            FatalKind::DiskFull
        } else if is_permission_error(error) {
            FatalKind::PermissionDenied
        } else {
            FatalKind::Filesystem
        };
        Self::fatal(kind, format!("{}: {}", context, error))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Integrity(_) => ErrorClass::Integrity,
            Self::Fatal { .. } | Self::Cancelled => ErrorClass::Fatal,
        }
    }

    /// Plain-language message suitable for the presentation layer.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Transient(_) => {
                "The connection to your storage account kept dropping. The original was left in place; try again later."
            }
            Self::Integrity(_) => {
                "The downloaded copy didn't match the original, so the original was left in place."
            }
            Self::Cancelled => "Archiving was stopped before this file was finished.",
            Self::Fatal { kind, .. } => match kind {
                FatalKind::Unauthorized => {
                    "Your storage account needs to be reconnected before this file can be archived."
                }
                FatalKind::NotFound => "This file is no longer available in your storage account.",
                FatalKind::DiskFull => "There isn't enough free space in the archive folder.",
                FatalKind::PermissionDenied => "The archive folder can't be written to.",
                FatalKind::Filesystem => {
                    "The file couldn't be saved to the archive folder. The original was left in place."
                }
                FatalKind::Remote => {
                    "Your storage account refused this request. The original was left in place."
                }
                FatalKind::StateStore => "The archive history couldn't be updated.",
            },
        }
    }
}

impl From<StorageError> for ArchiveError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Unauthorized(m) => Self::fatal(FatalKind::Unauthorized, m),
            StorageError::NotFound(m) => Self::fatal(FatalKind::NotFound, m),
            StorageError::RateLimited(m) => Self::Transient(format!("rate limited: {}", m)),
            StorageError::Transient(m) => Self::Transient(m),
            StorageError::Fatal(m) => Self::fatal(FatalKind::Remote, m),
        }
    }
}

/// Errors from the local archive state database.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state database error: {0}")]
    Database(String),
    #[error("state database I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt archive record for {remote_id}: {reason}")]
    Corrupt { remote_id: String, reason: String },
}

/// A failure that aborts the whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to list remote files: {0}")]
    Listing(#[from] StorageError),
    #[error(transparent)]
    StateStore(#[from] StateError),
}

impl PipelineError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Listing(StorageError::Unauthorized(_)) => {
                "Your storage account needs to be reconnected."
            }
            Self::Listing(e) if e.is_transient() => {
                "Your storage account couldn't be reached right now. Nothing was changed; try again later."
            }
            Self::Listing(_) => "Your files couldn't be listed. Nothing was changed.",
            Self::StateStore(_) => {
                "The archive history couldn't be read or updated, so archiving was stopped."
            }
        }
    }
}

fn is_disk_full_error(error: &io::Error) -> bool {
    if error.kind() == ErrorKind::StorageFull {
        return true;
    }
    matches!(error.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}

fn is_permission_error(error: &io::Error) -> bool {
    if error.kind() == ErrorKind::PermissionDenied {
        return true;
    }
    matches!(error.raw_os_error(), Some(code) if code == libc::EACCES || code == libc::EPERM)
}
