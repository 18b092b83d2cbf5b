//! Error types for the mlpipeline engine.
//!
//! Definition-time errors (`DuplicateStage`, `UnknownStage`, `CycleDetected`,
//! `UnresolvedInput`, ...) abort graph construction immediately. Run-time
//! errors (`StageExecution`, `Cancelled`) end up in the run record.

use crate::core::ValueType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// The main error type for pipeline definition and execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage with the same name is already registered.
    #[error("Stage '{name}' is already registered")]
    DuplicateStage {
        /// The duplicated stage name.
        name: String,
    },

    /// A referenced stage has not been registered.
    #[error("Unknown stage '{name}'")]
    UnknownStage {
        /// The missing stage name.
        name: String,
    },

    /// A stage name is empty or contains unsupported characters.
    #[error("Invalid stage name '{name}': {reason}")]
    InvalidStageName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `build()` was called before any stage was registered.
    #[error("Pipeline '{pipeline}' has no stages")]
    EmptyPipeline {
        /// The pipeline name.
        pipeline: String,
    },

    /// More than one producer writes the same context key.
    #[error("Output key '{key}' has multiple producers: {}", producers.join(", "))]
    OutputConflict {
        /// The contested key.
        key: String,
        /// Every producer of the key, in registration order.
        producers: Vec<String>,
    },

    /// An input key has no producer and no initial parameter.
    #[error("Input '{key}' of stage '{stage}' is unresolved: {reason}")]
    UnresolvedInput {
        /// The consuming stage.
        stage: String,
        /// The unresolved key.
        key: String,
        /// Details about what is missing.
        reason: String,
    },

    /// A producer or parameter type does not satisfy the consumer contract.
    #[error("Contract mismatch on '{key}' for '{stage}': expected {expected}, found {found}")]
    ContractMismatch {
        /// The consuming stage (or `params` for initial parameters).
        stage: String,
        /// The key whose types disagree.
        key: String,
        /// The type the consumer declared.
        expected: ValueType,
        /// The type that was provided.
        found: ValueType,
    },

    /// The dependency graph contains a cycle.
    #[error(transparent)]
    CycleDetected(#[from] CycleDetectedError),

    /// A stage failed after exhausting its retry budget.
    #[error("Stage '{stage}' failed after {attempts} attempt(s): {source}")]
    StageExecution {
        /// The failing stage.
        stage: String,
        /// Number of invocations made.
        attempts: u32,
        /// The last failure.
        #[source]
        source: StageError,
    },

    /// The run was cancelled.
    #[error("Pipeline cancelled: {reason}")]
    Cancelled {
        /// The cancellation reason.
        reason: String,
    },

    /// A workflow with the same id is already registered.
    #[error("Workflow '{id}' is already registered")]
    DuplicateWorkflow {
        /// The duplicated workflow id.
        id: String,
    },

    /// Selected workflows are not known.
    #[error("The following workflow(s) do not exist: '{}'", missing.join(","))]
    NoSuchWorkflows {
        /// The unknown workflow ids.
        missing: Vec<String>,
    },

    /// The configuration could not be parsed or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Returns true for errors raised while defining or validating a graph.
    #[must_use]
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStage { .. }
                | Self::UnknownStage { .. }
                | Self::InvalidStageName { .. }
                | Self::EmptyPipeline { .. }
                | Self::OutputConflict { .. }
                | Self::UnresolvedInput { .. }
                | Self::ContractMismatch { .. }
                | Self::CycleDetected(_)
        )
    }

    /// Returns diagnostic metadata for definition errors.
    #[must_use]
    pub fn error_info(&self) -> Option<ContractErrorInfo> {
        let info = match self {
            Self::DuplicateStage { name } => {
                ContractErrorInfo::new("PIPELINE-001-DUPLICATE", format!("Stage '{name}' registered twice"))
                    .with_fix_hint("Give every stage a unique name.")
            }
            Self::UnknownStage { name } => {
                ContractErrorInfo::new("PIPELINE-002-UNKNOWN", format!("Stage '{name}' not found"))
                    .with_fix_hint("Register both stages before declaring a dependency between them.")
            }
            Self::InvalidStageName { name, .. } => {
                ContractErrorInfo::new("PIPELINE-003-NAME", format!("Stage name '{name}' rejected"))
                    .with_fix_hint("Use letters, digits, '_', '-' or '.', starting with a letter or digit.")
            }
            Self::EmptyPipeline { .. } => {
                ContractErrorInfo::new("PIPELINE-004-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Register at least one stage before building.")
            }
            Self::OutputConflict { key, .. } => {
                ContractErrorInfo::new("PIPELINE-005-CONFLICT", format!("Key '{key}' written twice"))
                    .with_fix_hint("Rename one of the outputs so every key has a single producer.")
                    .with_context_entry("key", key.clone())
            }
            Self::UnresolvedInput { stage, key, .. } => {
                ContractErrorInfo::new("PIPELINE-006-UNRESOLVED", format!("No source for '{key}'"))
                    .with_fix_hint("Add a stage producing the key or declare it as an initial parameter.")
                    .with_context_entry("stage", stage.clone())
                    .with_context_entry("key", key.clone())
            }
            Self::ContractMismatch { stage, key, .. } => {
                ContractErrorInfo::new("PIPELINE-007-TYPE", format!("Type mismatch on '{key}'"))
                    .with_fix_hint("Align the producer's output type with the consumer's input type.")
                    .with_context_entry("stage", stage.clone())
            }
            Self::CycleDetected(err) => err.error_info.clone(),
            _ => return None,
        };
        Some(info)
    }
}

/// Metadata about a definition error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-008-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle; first and last entries match.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "PIPELINE-008-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a context key is written twice during a run.
#[derive(Debug, Clone, Error)]
#[error("Data conflict: key '{key}' already exists")]
pub struct DataConflictError {
    /// The conflicting key.
    pub key: String,
}

impl DataConflictError {
    /// Creates a new data conflict error.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// A single failed stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StageError {
    /// Human readable failure description.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl StageError {
    /// Creates a retryable stage error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates an error that must not be retried.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}
