//! # mlpipeline
//!
//! A workflow-definition and execution engine for ML processing stages.
//!
//! mlpipeline runs sequences of stages (data ingestion, feature extraction,
//! training, evaluation) with:
//!
//! - **Typed contracts**: every stage declares the keys it reads and writes
//! - **Validated graphs**: dependencies are derived from those keys and checked
//!   for conflicts, gaps, type mismatches and cycles before anything runs
//! - **Concurrent execution**: independent stages run in parallel up to a
//!   worker limit, with per-stage retries and cooperative cancellation
//! - **Run records**: per-stage state, attempts and timing for every run
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mlpipeline::prelude::*;
//!
//! let mut registry = StageRegistry::new("training");
//! registry.declare_param("source_uri", ValueType::String);
//! registry.register(
//!     StageSpec::from_stage(LoadStage)
//!         .with_input("source_uri", ValueType::String)
//!         .with_output("raw", ValueType::Array),
//! )?;
//! registry.register(
//!     StageSpec::from_stage(TrainStage)
//!         .with_input("raw", ValueType::Array)
//!         .with_output("model", ValueType::Object),
//! )?;
//! let graph = registry.build()?;
//!
//! let record = Executor::default().execute(&graph, params).await?;
//! let context = record.into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod stages;
pub mod testing;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{load_config, AppConfig, ConfigFormat};
    pub use crate::context::{RunContext, StageContext};
    pub use crate::core::{Contract, RunStatus, StageKind, StageOutput, StageState, ValueType};
    pub use crate::errors::{PipelineError, PipelineResult, StageError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        Executor, ExecutorConfig, FailureMode, PipelineGraph, RetryPolicy, RunRecord,
        StageRegistry, StageSpec,
    };
    pub use crate::stages::{AsyncFnStage, CommandStage, FnStage, Stage};
    pub use crate::workflow::{Workflow, WorkflowRegistry, WorkflowRun};
}
