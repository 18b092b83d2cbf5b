//! Mock stages for testing.
//!
//! Every mock is cheap to clone and clones share their call counter, so a
//! test can keep one handle while the registry owns another.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::StageContext;
use crate::core::StageOutput;
use crate::stages::Stage;

fn to_data<'a>(values: impl IntoIterator<Item = (&'a str, Value)>) -> HashMap<String, Value> {
    values.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Succeeds every time and counts its invocations.
#[derive(Debug, Clone)]
pub struct CountingStage {
    name: String,
    data: HashMap<String, Value>,
    calls: Arc<AtomicUsize>,
}

impl CountingStage {
    /// Creates a counting stage that produces nothing.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds a value to produce on every call.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for CountingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StageOutput::ok(self.data.clone())
    }
}

/// Produces a fixed set of values.
#[derive(Debug, Clone)]
pub struct ProducerStage {
    name: String,
    data: HashMap<String, Value>,
}

impl ProducerStage {
    /// Creates a producer of the given key/value pairs.
    #[must_use]
    pub fn new<'a>(name: impl Into<String>, values: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Self {
            name: name.into(),
            data: to_data(values),
        }
    }
}

#[async_trait]
impl Stage for ProducerStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        StageOutput::ok(self.data.clone())
    }
}

/// Fails on every call.
#[derive(Debug, Clone)]
pub struct FailingStage {
    name: String,
    message: String,
    retryable: bool,
    calls: Arc<AtomicUsize>,
}

impl FailingStage {
    /// Creates a stage that fails with a retryable error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            message: format!("{name} failed"),
            name,
            retryable: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets the failure message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Makes the failure non-retryable.
    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.retryable {
            StageOutput::fail(self.message.clone())
        } else {
            StageOutput::fail_fatal(self.message.clone())
        }
    }
}

/// Fails a fixed number of times, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyStage {
    name: String,
    failures: usize,
    data: HashMap<String, Value>,
    calls: Arc<AtomicUsize>,
}

impl FlakyStage {
    /// Creates a stage whose first `failures` calls fail.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            data: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds a value to produce once the stage succeeds.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FlakyStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            StageOutput::fail(format!("transient failure on attempt {}", ctx.attempt()))
        } else {
            StageOutput::ok(self.data.clone())
        }
    }
}

/// Sleeps before succeeding.
///
/// By default the sleep ignores cancellation, like a stage that never checks
/// its context; [`SlowStage::cooperative`] makes it stop early instead.
#[derive(Debug, Clone)]
pub struct SlowStage {
    name: String,
    delay: Duration,
    cooperative: bool,
    data: HashMap<String, Value>,
    calls: Arc<AtomicUsize>,
}

impl SlowStage {
    /// Creates a stage that sleeps for `delay`.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            cooperative: false,
            data: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns a cancel output as soon as the run is cancelled.
    #[must_use]
    pub fn cooperative(mut self) -> Self {
        self.cooperative = true;
        self
    }

    /// Adds a value to produce after sleeping.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.cooperative {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = ctx.cancellation().cancelled() => {
                    return StageOutput::cancel(ctx.cancellation().reason().unwrap_or_default());
                }
            }
        } else {
            tokio::time::sleep(self.delay).await;
        }
        StageOutput::ok(self.data.clone())
    }
}
