//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications with typed input/output contracts
//! - A registry that validates definitions into immutable graphs
//! - The concurrent graph executor with retries and cancellation
//! - Per-run records

mod executor;
mod graph;
mod record;
mod registry;
mod retry;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use executor::{Executor, ExecutorConfig, FailureMode};
pub use graph::PipelineGraph;
pub use record::{RunRecord, StageRecord};
pub use registry::{StageRegistry, PARAMS_PRODUCER};
pub use retry::{BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy, RetryState};
pub use spec::StageSpec;
