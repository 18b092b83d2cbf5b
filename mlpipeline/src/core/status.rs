//! Run and stage lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs within an ML workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Draws raw data (e.g., a warehouse query, a file download).
    Source,
    /// Cleans or reshapes data (e.g., feature extraction).
    Transform,
    /// Fits a model.
    Train,
    /// Scores or validates a model.
    Evaluate,
    /// Delivers processed data or artifacts (e.g., upload, publish).
    Sink,
    /// Anything else.
    #[default]
    Work,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Transform => write!(f, "transform"),
            Self::Train => write!(f, "train"),
            Self::Evaluate => write!(f, "evaluate"),
            Self::Sink => write!(f, "sink"),
            Self::Work => write!(f, "work"),
        }
    }
}

/// Lifecycle of a whole run: `Pending -> Running -> (Succeeded | Failed | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created, nothing dispatched yet.
    #[default]
    Pending,
    /// At least one stage has been dispatched.
    Running,
    /// Every stage finished successfully.
    Succeeded,
    /// A stage failed permanently.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Returns true if the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of a stage within a run:
/// `Waiting -> Ready -> Running -> (Done | Failed | Skipped | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Some producer has not finished yet.
    #[default]
    Waiting,
    /// All producers are done; waiting for a worker.
    Ready,
    /// Currently executing (possibly between retries).
    Running,
    /// Finished and its outputs are in the context.
    Done,
    /// Failed after exhausting retries.
    Failed,
    /// Not run because an upstream stage failed.
    Skipped,
    /// Not run, or interrupted, because the run was cancelled.
    Cancelled,
}

impl StageState {
    /// Returns true if the stage can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped | Self::Cancelled)
    }

    /// Returns true if the stage has not started yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Ready)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Source.to_string(), "source");
        assert_eq!(StageKind::Train.to_string(), "train");
        assert_eq!(StageKind::default(), StageKind::Work);
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_stage_state_predicates() {
        assert!(StageState::Done.is_terminal());
        assert!(StageState::Skipped.is_terminal());
        assert!(!StageState::Running.is_terminal());
        assert!(StageState::Waiting.is_pending());
        assert!(StageState::Ready.is_pending());
        assert!(!StageState::Running.is_pending());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&StageState::Skipped).unwrap();
        assert_eq!(json, r#""skipped""#);

        let status: RunStatus = serde_json::from_str(r#""succeeded""#).unwrap();
        assert_eq!(status, RunStatus::Succeeded);
    }
}
