//! Stage specifications.

use super::RetryPolicy;
use crate::core::{Contract, StageKind, ValueType};
use crate::stages::Stage;
use std::sync::Arc;

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Keys the stage reads, with their expected types.
    pub inputs: Contract,
    /// Keys the stage writes, with their declared types.
    pub outputs: Contract,
    /// Retry policy; the executor default applies when unset.
    pub retry: Option<RetryPolicy>,
    /// The kind of stage.
    pub kind: StageKind,
    /// Free-form description shown in execution plans.
    pub description: Option<String>,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            runner,
            inputs: Contract::new(),
            outputs: Contract::new(),
            retry: None,
            kind: StageKind::Work,
            description: None,
        }
    }

    /// Creates a specification named after the stage itself.
    #[must_use]
    pub fn from_stage<S: Stage + 'static>(stage: S) -> Self {
        let name = stage.name().to_string();
        Self::new(name, Arc::new(stage))
    }

    /// Declares an input key.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, ty: ValueType) -> Self {
        self.inputs.insert(key.into(), ty);
        self
    }

    /// Declares an output key.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, ty: ValueType) -> Self {
        self.outputs.insert(key.into(), ty);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::NoOpStage;

    #[test]
    fn test_stage_spec_builder() {
        let spec = StageSpec::from_stage(NoOpStage::new("train"))
            .with_input("features", ValueType::Array)
            .with_output("model", ValueType::Object)
            .with_retry(RetryPolicy::new().with_max_retries(2))
            .with_kind(StageKind::Train)
            .with_description("fit a model");

        assert_eq!(spec.name, "train");
        assert_eq!(spec.inputs.get("features"), Some(&ValueType::Array));
        assert_eq!(spec.outputs.get("model"), Some(&ValueType::Object));
        assert_eq!(spec.retry.as_ref().map(|r| r.max_retries), Some(2));
        assert_eq!(spec.kind, StageKind::Train);
    }
}
