//! Stage output type with factory methods.

use crate::errors::StageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// How a single stage invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// The invocation produced its outputs.
    Ok,
    /// The invocation failed.
    Fail,
    /// The stage gave up because the run is being cancelled.
    Cancel,
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Fail => write!(f, "fail"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// The output of one stage invocation.
///
/// On success `data` must hold exactly the keys the stage declared as
/// outputs; the executor commits them to the run context as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the invocation.
    pub status: OutputStatus,

    /// The produced values, keyed by output key.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, Value>,

    /// Error message (for failed invocations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Cancel reason (for cancelled invocations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    /// Whether a failure may be retried.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl Default for StageOutput {
    fn default() -> Self {
        Self::ok_empty()
    }
}

impl StageOutput {
    /// Creates a successful output with data.
    #[must_use]
    pub fn ok(data: HashMap<String, Value>) -> Self {
        Self {
            status: OutputStatus::Ok,
            data,
            error: None,
            cancel_reason: None,
            retryable: false,
        }
    }

    /// Creates a successful output with no data.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::ok(HashMap::new())
    }

    /// Creates a successful output with a single value.
    #[must_use]
    pub fn ok_value(key: impl Into<String>, value: Value) -> Self {
        Self::ok_empty().with_value(key, value)
    }

    /// Creates a failure that the executor retries per the stage's policy.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Fail,
            data: HashMap::new(),
            error: Some(error.into()),
            cancel_reason: None,
            retryable: true,
        }
    }

    /// Creates a failure that ends the stage without further attempts.
    #[must_use]
    pub fn fail_fatal(error: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::fail(error)
        }
    }

    /// Creates a cancel output with a reason.
    #[must_use]
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Cancel,
            data: HashMap::new(),
            error: None,
            cancel_reason: Some(reason.into()),
            retryable: false,
        }
    }

    /// Builds an output from a fallible stage body.
    #[must_use]
    pub fn from_result(result: anyhow::Result<HashMap<String, Value>>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => {
                let err = StageError::from(err);
                Self::fail(err.message)
            }
        }
    }

    /// Adds a single value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns true if the output indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutputStatus::Ok
    }

    /// Returns true if the output indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == OutputStatus::Fail
    }

    /// Gets a value from the data.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Returns the failure as a [`StageError`], if this output failed.
    #[must_use]
    pub fn stage_error(&self) -> Option<StageError> {
        if !self.is_failure() {
            return None;
        }
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| "stage failed without an error message".to_string());
        Some(StageError {
            message,
            retryable: self.retryable,
        })
    }
}
