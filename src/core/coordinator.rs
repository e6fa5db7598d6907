//! Scan, plan and archive, with a bounded pool of workers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use super::executor::Executor;
use super::models::{
    ItemError, ItemOutcome, ItemState, ItemStatus, RemoteFile, RunResult, WorkItem,
};
use super::planner::{self, Plan, Rules};
use super::progress::{ProgressEvent, ProgressReporter};
use super::retry::RetryPolicy;
use super::storage::ListQuery;
use crate::context::AppContext;
use crate::error::{ErrorClass, PipelineError};

pub struct Coordinator {
    ctx: AppContext,
}

impl Coordinator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.ctx.config.retry, self.ctx.config.call_timeout())
    }

    /// Every non-trashed file the user owns. No other filtering.
    pub async fn scan(&self) -> Result<Vec<RemoteFile>, PipelineError> {
        let storage = &self.ctx.storage;
        let files = self
            .retry_policy()
            .run("list", None, move |_| storage.list(ListQuery::default()))
            .await?;
        info!(count = files.len(), "Scanned remote files");
        Ok(files)
    }

    pub async fn plan(
        &self,
        files: &[RemoteFile],
        run_started: DateTime<Utc>,
    ) -> Result<Plan, PipelineError> {
        let snapshot = self.ctx.state.snapshot().await?;
        let rules = Rules::from_config(&self.ctx.config);
        let plan = planner::plan(
            files,
            &rules,
            &snapshot,
            &self.ctx.config.archive_root,
            run_started,
        );
        info!(
            eligible = plan.items.len(),
            skipped = plan.skipped.len(),
            resumable = plan.items.iter().filter(|i| i.resume.is_some()).count(),
            "Plan ready"
        );
        Ok(plan)
    }

    /// Execute planned items on at most `max_concurrent` workers.
    ///
    /// Outcomes come back in plan order. Items not started before
    /// cancellation are reported as skipped. A state store failure cancels
    /// the remaining work and is returned once in-flight items have settled.
    pub async fn run_archive(
        &self,
        items: Vec<WorkItem>,
        events: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunResult, PipelineError> {
        let run_id = Uuid::now_v7().to_string();
        let started_at = Utc::now();
        let span = info_span!("run", run_id = %run_id);

        self.archive_items(run_id, started_at, items, events, cancel)
            .instrument(span)
            .await
    }

    async fn archive_items(
        &self,
        run_id: String,
        started_at: DateTime<Utc>,
        items: Vec<WorkItem>,
        events: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunResult, PipelineError> {
        let config = &self.ctx.config;
        let dry_run = config.dry_run;
        let total = items.len();

        info!(
            eligible = total,
            dry_run,
            max_concurrent = config.max_concurrent,
            "Starting archive run"
        );
        events.emit(ProgressEvent::RunStarted {
            run_id: run_id.clone(),
            eligible: total,
            dry_run,
        });

        // Cancelled on user request or on a state store failure
        let run_cancel = cancel.child_token();
        let executor = Arc::new(Executor::new(&self.ctx, events.clone(), run_cancel.clone()));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let mut join_set: JoinSet<(usize, Result<ItemOutcome, PipelineError>)> = JoinSet::new();

        let summaries: Vec<_> = items
            .iter()
            .map(|item| (item.remote_id.clone(), item.name.clone(), item.category))
            .collect();
        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; total];

        for (idx, item) in items.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = run_cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let executor = executor.clone();
            let run_cancel = run_cancel.clone();

            join_set.spawn(
                async move {
                    let _permit = permit;
                    let result = executor.execute(item).await;
                    if result.is_err() {
                        run_cancel.cancel();
                    }
                    (idx, result)
                }
                .in_current_span(),
            );
        }

        let mut fatal: Option<PipelineError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, Ok(outcome))) => outcomes[idx] = Some(outcome),
                Ok((idx, Err(e))) => {
                    error!(remote_id = %summaries[idx].0, error = %e, "State store failure, stopping run");
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    // A panicked worker takes only its own item down
                    error!(error = %e, "Archive worker panicked");
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let outcomes: Vec<ItemOutcome> = outcomes
            .into_iter()
            .zip(summaries)
            .map(|(outcome, (remote_id, name, category))| {
                outcome.unwrap_or_else(|| {
                    let (status, error) = if run_cancel.is_cancelled() {
                        (ItemStatus::Skipped, None)
                    } else {
                        (
                            ItemStatus::Failed,
                            Some(ItemError {
                                class: ErrorClass::Fatal,
                                message: "Archiving this file stopped unexpectedly. The original was left in place.".to_string(),
                                detail: "worker task ended without an outcome".to_string(),
                            }),
                        )
                    };
                    ItemOutcome {
                        remote_id,
                        name,
                        category,
                        destination: None,
                        status,
                        last_state: ItemState::Pending,
                        trashed: false,
                        error,
                    }
                })
            })
            .collect();

        let result = RunResult::from_outcomes(run_id, started_at, dry_run, outcomes);
        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "Archive run finished"
        );
        events.emit(ProgressEvent::finished(&result));
        Ok(result)
    }

    /// Scan, plan and archive in one go. Listing or snapshot failures abort
    /// before anything is touched.
    pub async fn run(
        &self,
        events: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunResult, PipelineError> {
        let run_started = Utc::now();
        let files = self.scan().await?;
        let plan = self.plan(&files, run_started).await?;
        self.run_archive(plan.items, events, cancel).await
    }
}
