use async_trait::async_trait;

use super::models::{ExportSpec, RemoteFile};
use crate::error::StorageError;

/// Which part of the account a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationFilter {
    #[default]
    Any,
    /// Only the user's own drive; excludes shared-with-me and shared drives.
    PrimaryDrive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub owned_only: bool,
    pub location: LocationFilter,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            owned_only: true,
            location: LocationFilter::Any,
        }
    }
}

/// A pull-based byte source for one download or export.
#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk of bytes, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
}

pub type ByteStream = Box<dyn ByteSource>;

/// The remote file store.
///
/// Implementations own transport details (auth headers, pagination, wire
/// format) and surface every failure as a [`StorageError`]. Timeouts and
/// retries are applied by the caller.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// List non-trashed files.
    async fn list(&self, query: ListQuery) -> Result<Vec<RemoteFile>, StorageError>;

    /// Open the raw content of a regular file.
    async fn download(&self, id: &str) -> Result<ByteStream, StorageError>;

    /// Open an export of a native document in the given format.
    async fn export_native(&self, id: &str, format: &ExportSpec)
    -> Result<ByteStream, StorageError>;

    /// Move a file to the remote trash. Never a permanent delete.
    async fn trash(&self, id: &str) -> Result<(), StorageError>;
}
