//! Lifecycle events emitted by the executor.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run was accepted and is about to dispatch stages.
pub const RUN_STARTED: &str = "run.started";
/// A run reached a terminal status.
pub const RUN_COMPLETED: &str = "run.completed";
/// A stage attempt began.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage attempt failed and another attempt is scheduled.
pub const STAGE_RETRYING: &str = "stage.retrying";
/// A stage finished and its outputs were committed.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage failed permanently.
pub const STAGE_FAILED: &str = "stage.failed";
/// A stage was not run because an upstream stage failed.
pub const STAGE_SKIPPED: &str = "stage.skipped";
/// A stage was not run or was interrupted because the run was cancelled.
pub const STAGE_CANCELLED: &str = "stage.cancelled";
