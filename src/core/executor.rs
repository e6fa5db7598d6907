//! Per-item archive protocol.
//!
//! ```text
//! Pending -> Downloading -> Verifying -> Relocating -> TrashPending -> Done
//!    \            \              \             \              \
//!     +------------+--------------+-------------+--------------+--> Failed
//! ```
//!
//! The remote original is only trashed after the local copy has been
//! verified and moved into place. If trashing fails, a `TrashPending` record
//! marks the item so the next run can finish it without downloading again.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::models::{
    ArchiveRecord, ItemError, ItemOutcome, ItemState, ItemStatus, RecordStatus, WorkItem,
};
use super::progress::{ProgressEvent, ProgressReporter};
use super::retry::{RetryPolicy, Retryable};
use super::staging::StagingArea;
use super::storage::StorageClient;
use super::verifier::verify_staged;
use crate::context::AppContext;
use crate::db::StateStore;
use crate::error::{ArchiveError, FatalKind, PipelineError};

/// Bytes between progress events while downloading (1MB)
const PROGRESS_UPDATE_INTERVAL: u64 = 1024 * 1024;

/// Where and why an item stopped short of `Done`.
struct Halt {
    state: ItemState,
    error: ArchiveError,
}

impl Halt {
    fn at(state: ItemState) -> impl FnOnce(ArchiveError) -> Halt {
        move |error| Halt { state, error }
    }
}

pub struct Executor {
    storage: Arc<dyn StorageClient>,
    state: StateStore,
    staging: StagingArea,
    policy: RetryPolicy,
    dry_run: bool,
    trash_after: bool,
    events: ProgressReporter,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(ctx: &AppContext, events: ProgressReporter, cancel: CancellationToken) -> Self {
        let config = &ctx.config;
        Self {
            storage: ctx.storage.clone(),
            state: ctx.state.clone(),
            staging: StagingArea::new(&config.archive_root),
            policy: RetryPolicy::from_config(&config.retry, config.call_timeout()),
            dry_run: config.dry_run,
            trash_after: config.trash_after,
            events,
            cancel,
        }
    }

    /// Drive one item to a terminal outcome.
    ///
    /// Item-level failures are reported in the outcome. Only a state store
    /// failure is returned as an error, since continuing would archive files
    /// without a durable record of it.
    pub async fn execute(&self, item: WorkItem) -> Result<ItemOutcome, PipelineError> {
        let span = info_span!("item", remote_id = %item.remote_id, name = %item.name);
        self.execute_inner(item).instrument(span).await
    }

    async fn execute_inner(&self, item: WorkItem) -> Result<ItemOutcome, PipelineError> {
        if self.cancel.is_cancelled() {
            return Ok(self.skipped(&item, ItemState::Pending));
        }

        self.events
            .transition(&item.remote_id, &item.name, ItemState::Pending);

        if self.dry_run {
            let destination = self.would_place(&item).await?;
            debug!(destination = %destination.display(), "Would archive");
            return Ok(outcome(
                &item,
                ItemStatus::WouldArchive,
                ItemState::Pending,
                Some(destination),
                None,
            ));
        }

        if let Some(local_copy) = &item.resume {
            if let Some(record) = self.resumable(&item, local_copy).await? {
                info!(path = %record.local_path.display(), "Resuming trash of archived file");
                return self.finish(&item, record).await;
            }
            info!(path = %local_copy.display(), "Local copy missing or changed, archiving again");
        }

        match self.transfer(&item).await {
            Ok(record) => self.finish(&item, record).await,
            Err(Halt {
                state,
                error: ArchiveError::Cancelled,
            }) => Ok(self.skipped(&item, state)),
            Err(Halt { state, error }) => Ok(self.failed(&item, state, None, error)),
        }
    }

    /// The path a real run would end on, found without writing anything.
    async fn would_place(&self, item: &WorkItem) -> Result<PathBuf, PipelineError> {
        if let Some(local_copy) = &item.resume {
            if let Some(record) = self.resumable(item, local_copy).await? {
                return Ok(record.local_path);
            }
        }
        Ok(self.staging.preview(&item.destination, item.expected_size))
    }

    /// The recorded trash-pending copy, if it is still on disk with the
    /// recorded size.
    async fn resumable(
        &self,
        item: &WorkItem,
        local_copy: &Path,
    ) -> Result<Option<ArchiveRecord>, PipelineError> {
        let Some(record) = self.state.get(&item.remote_id).await? else {
            return Ok(None);
        };
        if record.status != RecordStatus::TrashPending || record.local_path != local_copy {
            return Ok(None);
        }

        let intact = tokio::fs::metadata(local_copy)
            .await
            .map(|meta| meta.is_file() && meta.len() == record.size)
            .unwrap_or(false);
        Ok(intact.then_some(record))
    }

    /// Download, verify and place the file. Returns the record to write once
    /// the remote side has been dealt with.
    async fn transfer(&self, item: &WorkItem) -> Result<ArchiveRecord, Halt> {
        if let Some(expected) = item.expected_size {
            let available = self
                .staging
                .free_space()
                .map_err(Halt::at(ItemState::Pending))?;
            if available < expected {
                return Err(Halt {
                    state: ItemState::Pending,
                    error: ArchiveError::fatal(
                        FatalKind::DiskFull,
                        format!("{} bytes needed, {} available", expected, available),
                    ),
                });
            }
        }

        self.events
            .transition(&item.remote_id, &item.name, ItemState::Downloading);
        let staged_path = self.staging.new_path();
        if let Err(error) = self.download(item, &staged_path).await {
            self.staging.discard(&staged_path).await;
            return Err(Halt {
                state: ItemState::Downloading,
                error,
            });
        }

        self.events
            .transition(&item.remote_id, &item.name, ItemState::Verifying);
        let verified = match verify_staged(&staged_path, item.expected_size).await {
            Ok(verified) => verified,
            Err(error) => {
                self.staging.discard(&staged_path).await;
                return Err(Halt {
                    state: ItemState::Verifying,
                    error,
                });
            }
        };

        if self.cancel.is_cancelled() {
            self.staging.discard(&staged_path).await;
            return Err(Halt {
                state: ItemState::Verifying,
                error: ArchiveError::Cancelled,
            });
        }

        self.events
            .transition(&item.remote_id, &item.name, ItemState::Relocating);
        // Staging is kept on failure; the remote original is untouched
        let placement = self
            .staging
            .place(&verified, &item.destination, item.modified_time)
            .await
            .map_err(Halt::at(ItemState::Relocating))?;
        if placement.reused {
            info!(path = %placement.path.display(), "Identical copy already archived, keeping it");
        }

        Ok(ArchiveRecord {
            remote_id: item.remote_id.clone(),
            name: item.name.clone(),
            local_path: placement.path,
            size: verified.size,
            content_hash: verified.hash,
            status: RecordStatus::TrashPending,
            trashed: false,
            archived_at: Utc::now(),
        })
    }

    async fn download(&self, item: &WorkItem, staged_path: &Path) -> Result<u64, ArchiveError> {
        self.policy
            .run("download", Some(&self.cancel), move |attempt| {
                self.download_attempt(item, staged_path, attempt)
            })
            .await
    }

    async fn download_attempt(
        &self,
        item: &WorkItem,
        staged_path: &Path,
        attempt: u32,
    ) -> Result<u64, ArchiveError> {
        let timeout = self.policy.call_timeout;
        let mut writer = self.staging.open(staged_path).await?;

        debug!(attempt, "Opening remote stream");
        let opened = match &item.export {
            Some(format) => {
                tokio::time::timeout(
                    timeout,
                    self.storage.export_native(&item.remote_id, format),
                )
                .await
            }
            None => tokio::time::timeout(timeout, self.storage.download(&item.remote_id)).await,
        };
        let mut stream = opened.map_err(|_| ArchiveError::timed_out(timeout))??;

        let mut last_reported = 0;
        loop {
            let chunk = tokio::time::timeout(timeout, stream.next_chunk())
                .await
                .map_err(|_| ArchiveError::timed_out(timeout))??;
            let Some(chunk) = chunk else {
                break;
            };
            writer.write_chunk(&chunk).await?;

            if writer.written() - last_reported >= PROGRESS_UPDATE_INTERVAL {
                last_reported = writer.written();
                self.events
                    .bytes(&item.remote_id, last_reported, item.expected_size);
            }

            // The chunk just read is kept on disk; the caller discards staging
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
        }

        let written = writer.finish().await?;
        self.events
            .bytes(&item.remote_id, written, item.expected_size);
        Ok(written)
    }

    /// Trash the remote original (if configured) and write the final record.
    /// Not interruptible: the local copy is already in place.
    async fn finish(
        &self,
        item: &WorkItem,
        mut record: ArchiveRecord,
    ) -> Result<ItemOutcome, PipelineError> {
        self.events
            .transition(&item.remote_id, &item.name, ItemState::TrashPending);

        if self.trash_after {
            let storage = &self.storage;
            let remote_id = item.remote_id.as_str();
            let trashed = self
                .policy
                .run_call("trash", None, move |_| storage.trash(remote_id))
                .await;

            if let Err(e) = trashed {
                record.status = RecordStatus::TrashPending;
                record.trashed = false;
                self.state.record(&record).await?;
                let destination = Some(record.local_path);
                return Ok(self.failed(
                    item,
                    ItemState::TrashPending,
                    destination,
                    ArchiveError::from(e),
                ));
            }
        }

        record.status = RecordStatus::Archived;
        record.trashed = self.trash_after;
        self.state.record(&record).await?;

        self.events
            .transition(&item.remote_id, &item.name, ItemState::Done);
        info!(
            path = %record.local_path.display(),
            size = record.size,
            trashed = record.trashed,
            "Archived"
        );

        let mut done = outcome(
            item,
            ItemStatus::Archived,
            ItemState::Done,
            Some(record.local_path),
            None,
        );
        done.trashed = record.trashed;
        Ok(done)
    }

    fn skipped(&self, item: &WorkItem, state: ItemState) -> ItemOutcome {
        debug!(state = %state, "Cancelled before completion");
        self.events.emit(ProgressEvent::Skipped {
            remote_id: item.remote_id.clone(),
            name: item.name.clone(),
        });
        outcome(item, ItemStatus::Skipped, state, None, None)
    }

    fn failed(
        &self,
        item: &WorkItem,
        state: ItemState,
        destination: Option<PathBuf>,
        error: ArchiveError,
    ) -> ItemOutcome {
        warn!(state = %state, error = %error, "Item failed");
        self.events
            .failed(&item.remote_id, &item.name, error.user_message());
        outcome(item, ItemStatus::Failed, state, destination, Some(error))
    }
}

fn outcome(
    item: &WorkItem,
    status: ItemStatus,
    last_state: ItemState,
    destination: Option<PathBuf>,
    error: Option<ArchiveError>,
) -> ItemOutcome {
    ItemOutcome {
        remote_id: item.remote_id.clone(),
        name: item.name.clone(),
        category: item.category,
        destination,
        status,
        last_state,
        trashed: false,
        error: error.map(|e| ItemError {
            class: e.class(),
            message: e.user_message().to_string(),
            detail: e.to_string(),
        }),
    }
}
