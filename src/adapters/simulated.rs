//! In-memory storage backend for simulation mode and tests.
//!
//! `SimulatedStorage` is handed to the pipeline; the paired
//! `StorageController` stays with the caller to seed files, inject failures
//! and inspect what the pipeline did.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::{ByteSource, ByteStream, ExportSpec, ListQuery, LocationFilter, RemoteFile, StorageClient};
use crate::error::StorageError;

const CHUNK_SIZE: u64 = 128 * 1024;
const NATIVE_PREFIX: &str = "application/vnd.google-apps.";

/// File content. `Pattern` generates deterministic bytes on the fly so large
/// files cost no memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Bytes(Vec<u8>),
    Pattern { len: u64 },
}

impl Content {
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Pattern { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slice(&self, start: u64, end: u64) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes[start as usize..end as usize].to_vec(),
            Self::Pattern { .. } => (start..end).map(pattern_byte).collect(),
        }
    }

    /// Full content as bytes. Only sensible for small files.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.slice(0, self.len())
    }
}

fn pattern_byte(offset: u64) -> u8 {
    (offset.wrapping_mul(31).wrapping_add(7) % 251) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Download,
    Export,
    Trash,
}

struct SimFile {
    meta: RemoteFile,
    content: Content,
    trashed: bool,
    /// Serve only this many bytes, simulating a silently short transfer.
    truncate_to: Option<u64>,
}

struct Injected {
    error: StorageError,
    remaining: u32,
}

/// Mid-stream failure: the stream errors after `after_bytes`.
struct Interruption {
    after_bytes: u64,
    error: StorageError,
    remaining: u32,
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, SimFile>,
    failures: HashMap<(String, Operation), Injected>,
    interruptions: HashMap<String, Interruption>,
    calls: HashMap<(String, Operation), u32>,
    chunk_delay: Option<Duration>,
    active_streams: usize,
    peak_streams: usize,
}

impl Inner {
    fn count(&mut self, id: &str, op: Operation) {
        *self.calls.entry((id.to_string(), op)).or_insert(0) += 1;
    }

    fn injected(&mut self, id: &str, op: Operation) -> Option<StorageError> {
        let key = (id.to_string(), op);
        let injected = self.failures.get_mut(&key)?;
        let error = injected.error.clone();
        injected.remaining = injected.remaining.saturating_sub(1);
        if injected.remaining == 0 {
            self.failures.remove(&key);
        }
        Some(error)
    }

    fn open_stream(&mut self, id: &str) -> Result<(Content, u64, Option<(u64, StorageError)>), StorageError> {
        let file = self
            .files
            .get(id)
            .filter(|f| !f.trashed)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let content = file.content.clone();
        let len = file.truncate_to.unwrap_or(content.len()).min(content.len());

        let interruption = match self.interruptions.get_mut(id) {
            Some(interruption) => {
                let fail = (interruption.after_bytes, interruption.error.clone());
                interruption.remaining = interruption.remaining.saturating_sub(1);
                if interruption.remaining == 0 {
                    self.interruptions.remove(id);
                }
                Some(fail)
            }
            None => None,
        };

        self.active_streams += 1;
        self.peak_streams = self.peak_streams.max(self.active_streams);
        Ok((content, len, interruption))
    }
}

type Shared = Arc<Mutex<Inner>>;

fn lock(inner: &Shared) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedStorage {
    inner: Shared,
}

/// Test-side handle onto a [`SimulatedStorage`].
#[derive(Clone)]
pub struct StorageController {
    inner: Shared,
}

impl SimulatedStorage {
    pub fn new() -> (Self, StorageController) {
        let inner = Arc::new(Mutex::new(Inner::default()));
        (
            Self {
                inner: inner.clone(),
            },
            StorageController { inner },
        )
    }

    /// A small account for trying the CLI without credentials.
    pub fn seeded() -> Self {
        let (storage, controller) = Self::new();
        let mb = 1024 * 1024;
        let demo = [
            ("sim-001", "Beach trip.mp4", "video/mp4", 640 * mb, (2023, 7, 14)),
            ("sim-002", "IMG_2041.HEIC", "image/heic", 3 * mb, (2024, 2, 3)),
            ("sim-003", "Raw exports.zip", "application/zip", 310 * mb, (2022, 11, 20)),
            ("sim-004", "Quarterly report", "application/vnd.google-apps.document", 0, (2024, 5, 9)),
            ("sim-005", "podcast-ep12.mp3", "audio/mpeg", 220 * mb, (2021, 9, 1)),
            ("sim-006", "Holiday", "application/vnd.google-apps.folder", 0, (2020, 1, 1)),
        ];

        for (id, name, mime, size, (y, m, d)) in demo {
            let content_len = if size == 0 { 48 * 1024 } else { size };
            controller.add_file(
                RemoteFile {
                    id: id.to_string(),
                    name: name.to_string(),
                    size,
                    mime_type: mime.to_string(),
                    owned_by_me: true,
                    in_primary_drive: true,
                    modified_time: Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).single(),
                    created_time: None,
                },
                Content::Pattern { len: content_len },
            );
        }
        storage
    }

    fn stream(&self, id: &str, op: Operation) -> Result<ByteStream, StorageError> {
        let (content, len, interruption, delay) = {
            let mut inner = lock(&self.inner);
            inner.count(id, op);
            if let Some(error) = inner.injected(id, op) {
                return Err(error);
            }
            let (content, len, interruption) = inner.open_stream(id)?;
            (content, len, interruption, inner.chunk_delay)
        };

        Ok(Box::new(SimStream {
            inner: self.inner.clone(),
            content,
            len,
            offset: 0,
            interruption,
            delay,
        }))
    }
}

#[async_trait]
impl StorageClient for SimulatedStorage {
    async fn list(&self, query: ListQuery) -> Result<Vec<RemoteFile>, StorageError> {
        let mut inner = lock(&self.inner);
        inner.count("", Operation::List);
        if let Some(error) = inner.injected("", Operation::List) {
            return Err(error);
        }

        Ok(inner
            .files
            .values()
            .filter(|f| !f.trashed)
            .filter(|f| !query.owned_only || f.meta.owned_by_me)
            .filter(|f| match query.location {
                LocationFilter::Any => true,
                LocationFilter::PrimaryDrive => f.meta.in_primary_drive,
            })
            .map(|f| f.meta.clone())
            .collect())
    }

    async fn download(&self, id: &str) -> Result<ByteStream, StorageError> {
        let native = lock(&self.inner)
            .files
            .get(id)
            .is_some_and(|f| f.meta.mime_type.starts_with(NATIVE_PREFIX));
        if native {
            return Err(StorageError::Fatal(format!(
                "{} is a native document and must be exported",
                id
            )));
        }
        self.stream(id, Operation::Download)
    }

    async fn export_native(&self, id: &str, _format: &ExportSpec) -> Result<ByteStream, StorageError> {
        let native = lock(&self.inner)
            .files
            .get(id)
            .is_none_or(|f| f.meta.mime_type.starts_with(NATIVE_PREFIX));
        if !native {
            return Err(StorageError::Fatal(format!("{} cannot be exported", id)));
        }
        self.stream(id, Operation::Export)
    }

    async fn trash(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = lock(&self.inner);
        inner.count(id, Operation::Trash);
        if let Some(error) = inner.injected(id, Operation::Trash) {
            return Err(error);
        }
        let file = inner
            .files
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        file.trashed = true;
        Ok(())
    }
}

struct SimStream {
    inner: Shared,
    content: Content,
    len: u64,
    offset: u64,
    interruption: Option<(u64, StorageError)>,
    delay: Option<Duration>,
}

#[async_trait]
impl ByteSource for SimStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((after, error)) = &self.interruption {
            if self.offset >= *after {
                return Err(error.clone());
            }
        }

        if self.offset >= self.len {
            return Ok(None);
        }

        let mut end = (self.offset + CHUNK_SIZE).min(self.len);
        if let Some((after, _)) = &self.interruption {
            end = end.min((*after).max(self.offset + 1));
        }
        let chunk = self.content.slice(self.offset, end);
        self.offset = end;
        Ok(Some(chunk))
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.active_streams = inner.active_streams.saturating_sub(1);
    }
}

impl StorageController {
    pub fn add_file(&self, meta: RemoteFile, content: Content) {
        lock(&self.inner).files.insert(
            meta.id.clone(),
            SimFile {
                meta,
                content,
                trashed: false,
                truncate_to: None,
            },
        );
    }

    /// Make the next `times` calls of `op` on `id` fail. Use an empty id for
    /// [`Operation::List`].
    pub fn fail_next(&self, id: &str, op: Operation, error: StorageError, times: u32) {
        lock(&self.inner).failures.insert(
            (id.to_string(), op),
            Injected {
                error,
                remaining: times,
            },
        );
    }

    /// Make the next `times` streams of `id` fail after `after_bytes`.
    pub fn interrupt_download(&self, id: &str, after_bytes: u64, error: StorageError, times: u32) {
        lock(&self.inner).interruptions.insert(
            id.to_string(),
            Interruption {
                after_bytes,
                error,
                remaining: times,
            },
        );
    }

    /// Serve only `len` bytes of `id` while still reporting the full size.
    pub fn truncate_download(&self, id: &str, len: u64) {
        if let Some(file) = lock(&self.inner).files.get_mut(id) {
            file.truncate_to = Some(len);
        }
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        lock(&self.inner).chunk_delay = Some(delay);
    }

    pub fn calls(&self, id: &str, op: Operation) -> u32 {
        lock(&self.inner)
            .calls
            .get(&(id.to_string(), op))
            .copied()
            .unwrap_or(0)
    }

    pub fn download_calls(&self, id: &str) -> u32 {
        self.calls(id, Operation::Download)
    }

    pub fn export_calls(&self, id: &str) -> u32 {
        self.calls(id, Operation::Export)
    }

    pub fn trash_calls(&self, id: &str) -> u32 {
        self.calls(id, Operation::Trash)
    }

    pub fn list_calls(&self) -> u32 {
        self.calls("", Operation::List)
    }

    pub fn is_trashed(&self, id: &str) -> bool {
        lock(&self.inner).files.get(id).is_some_and(|f| f.trashed)
    }

    pub fn content(&self, id: &str) -> Option<Content> {
        lock(&self.inner).files.get(id).map(|f| f.content.clone())
    }

    /// Most streams that were open at the same time.
    pub fn peak_concurrent_streams(&self) -> usize {
        lock(&self.inner).peak_streams
    }
}
