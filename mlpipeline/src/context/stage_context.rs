//! Per-invocation view handed to a stage.

use crate::cancellation::CancellationToken;
use anyhow::{anyhow, Context as _};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What a stage sees while it runs.
///
/// Only the stage's declared inputs are present; the rest of the run context
/// stays out of reach.
#[derive(Debug, Clone)]
pub struct StageContext {
    stage: String,
    run_id: Uuid,
    attempt: u32,
    inputs: HashMap<String, Value>,
    cancel: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a stage context.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        run_id: Uuid,
        attempt: u32,
        inputs: HashMap<String, Value>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            stage: stage.into(),
            run_id,
            attempt,
            inputs,
            cancel,
        }
    }

    /// Creates a context for calling a stage directly, outside any run.
    #[must_use]
    pub fn detached(stage: impl Into<String>, inputs: HashMap<String, Value>) -> Self {
        Self::new(stage, Uuid::new_v4(), 1, inputs, Arc::new(CancellationToken::new()))
    }

    /// Returns the name of the running stage.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage
    }

    /// Returns the id of the run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Gets an input value.
    #[must_use]
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Gets an input value or fails with a descriptive error.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not one of the stage's inputs.
    pub fn require(&self, key: &str) -> anyhow::Result<&Value> {
        self.inputs
            .get(key)
            .ok_or_else(|| anyhow!("stage '{}' has no input '{key}'", self.stage))
    }

    /// Deserializes an input into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or does not deserialize into `T`.
    pub fn input_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self.require(key)?.clone();
        serde_json::from_value(value).with_context(|| format!("decoding input '{key}'"))
    }

    /// Returns all inputs.
    #[must_use]
    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the run's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> StageContext {
        StageContext::detached(
            "train",
            HashMap::from([
                ("epochs".to_string(), json!(3)),
                ("features".to_string(), json!([0.5, 1.5])),
            ]),
        )
    }

    #[test]
    fn test_inputs() {
        let ctx = ctx();
        assert_eq!(ctx.stage_name(), "train");
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.input("epochs"), Some(&json!(3)));
        assert!(ctx.input("labels").is_none());
        assert_eq!(ctx.inputs().len(), 2);
    }

    #[test]
    fn test_require_missing_input() {
        let err = ctx().require("labels").unwrap_err();
        assert_eq!(err.to_string(), "stage 'train' has no input 'labels'");
    }

    #[test]
    fn test_input_as() {
        let ctx = ctx();
        let features: Vec<f64> = ctx.input_as("features").unwrap();
        assert_eq!(features, vec![0.5, 1.5]);

        let err = ctx.input_as::<String>("epochs").unwrap_err();
        assert!(err.to_string().contains("decoding input 'epochs'"));
    }

    #[test]
    fn test_cancellation_visible() {
        let ctx = ctx();
        assert!(!ctx.is_cancelled());
        ctx.cancellation().cancel("stop");
        assert!(ctx.is_cancelled());
    }
}
