//! Progress events for the presentation layer.
//!
//! The core never waits on a consumer: events go over an unbounded channel
//! and are dropped silently once the receiver is gone. Progress is not
//! persisted; only archive records reach the state store.

use serde::Serialize;
use tokio::sync::mpsc;

use super::models::{ItemState, RunResult};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
        eligible: usize,
        dry_run: bool,
    },
    Transition {
        remote_id: String,
        name: String,
        state: ItemState,
        /// User-facing message when the transition is to `Failed`.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Bytes {
        remote_id: String,
        downloaded: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },
    Skipped {
        remote_id: String,
        name: String,
    },
    RunFinished {
        run_id: String,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

impl ProgressEvent {
    pub fn finished(result: &RunResult) -> Self {
        Self::RunFinished {
            run_id: result.run_id.clone(),
            succeeded: result.succeeded,
            failed: result.failed,
            skipped: result.skipped,
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Cloneable sending side handed to every worker.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn transition(&self, remote_id: &str, name: &str, state: ItemState) {
        self.emit(ProgressEvent::Transition {
            remote_id: remote_id.to_string(),
            name: name.to_string(),
            state,
            error: None,
        });
    }

    pub fn failed(&self, remote_id: &str, name: &str, message: &str) {
        self.emit(ProgressEvent::Transition {
            remote_id: remote_id.to_string(),
            name: name.to_string(),
            state: ItemState::Failed,
            error: Some(message.to_string()),
        });
    }

    pub fn bytes(&self, remote_id: &str, downloaded: u64, total: Option<u64>) {
        self.emit(ProgressEvent::Bytes {
            remote_id: remote_id.to_string(),
            downloaded,
            total,
        });
    }
}
