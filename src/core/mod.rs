pub mod classifier;
pub mod coordinator;
pub mod executor;
pub mod models;
pub mod organizer;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod staging;
pub mod storage;
pub mod verifier;

pub use classifier::{Classification, classify};
pub use coordinator::Coordinator;
pub use executor::Executor;
pub use models::{
    ArchiveRecord, Category, ExportSpec, ItemError, ItemOutcome, ItemState, ItemStatus,
    RecordStatus, RemoteFile, RunResult, TimestampSource, WorkItem,
};
pub use planner::{Plan, Rules, SkipReason, SkippedFile};
pub use progress::{EventReceiver, ProgressEvent, ProgressReporter};
pub use retry::RetryPolicy;
pub use staging::StagingArea;
pub use storage::{ByteSource, ByteStream, ListQuery, LocationFilter, StorageClient};
