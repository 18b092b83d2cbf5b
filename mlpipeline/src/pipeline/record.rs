//! Per-run history.

use crate::context::RunContext;
use crate::core::{RunStatus, StageState};
use crate::errors::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// What happened to one stage during a run.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    /// The stage name.
    pub name: String,
    /// Final state.
    pub state: StageState,
    /// Number of invocations made.
    pub attempts: u32,
    /// When the first attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached its final state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// The error of the last failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StageState::Waiting,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Returns how long the stage ran, if it started and finished.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }
}

/// The outcome and history of one `execute` call.
///
/// Records are kept even when the run fails or is cancelled: every stage that
/// finished keeps its state, and the context holds everything committed
/// before the run stopped.
#[derive(Debug, Serialize)]
pub struct RunRecord {
    /// Unique run id (UUID v4).
    pub run_id: Uuid,
    /// The pipeline name.
    pub pipeline: String,
    /// Fingerprint of the executed graph.
    pub fingerprint: String,
    /// Final run status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub finished_at: DateTime<Utc>,
    /// Per-stage records, in registration order.
    pub stages: Vec<StageRecord>,
    /// Stage names in the order they reached `Done`.
    pub completion_order: Vec<String>,
    /// Snapshot of the run context at the end of the run.
    pub context: BTreeMap<String, Value>,
    /// The error that ended the run, if any.
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
}

impl RunRecord {
    /// Returns the final run status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Returns true if every stage finished successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Looks up a stage record by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the final state of a stage.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<StageState> {
        self.stage(name).map(|s| s.state)
    }

    /// Gets a value from the final context.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Returns stage names in completion order.
    #[must_use]
    pub fn completion_order(&self) -> &[String] {
        &self.completion_order
    }

    /// Returns the error that ended the run.
    #[must_use]
    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    /// Returns the wall-clock duration of the run.
    #[must_use]
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Converts the record into the final context or the terminal error.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run.
    pub fn into_result(self) -> Result<RunContext, PipelineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(RunContext::from(self.context)),
        }
    }
}

fn serialize_error<S: Serializer>(error: &Option<PipelineError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_str(&err.to_string()),
        None => serializer.serialize_none(),
    }
}
