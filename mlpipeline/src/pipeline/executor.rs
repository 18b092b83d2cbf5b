//! Graph execution.
//!
//! Stages become ready as soon as every producer they depend on is done and
//! are dispatched in registration order, at most `max_workers` at a time.
//! Each dispatched stage runs on its own tokio task, retrying according to
//! its policy; the executor loop owns all run state and commits outputs to
//! the run context.

use super::graph::PipelineGraph;
use super::record::{RunRecord, StageRecord};
use super::registry::PARAMS_PRODUCER;
use super::retry::{RetryDecision, RetryPolicy, RetryState};
use super::StageSpec;
use crate::cancellation::CancellationToken;
use crate::context::{RunContext, StageContext};
use crate::core::{OutputStatus, RunStatus, StageOutput, StageState, ValueType};
use crate::errors::{PipelineError, PipelineResult, StageError};
use crate::events::{self, EventSink, NoOpEventSink};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What the executor does after a stage fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop dispatching new stages after the first failure (default).
    #[default]
    FailFast,
    /// Keep running branches that do not depend on the failed stage.
    ContinueOnFailure,
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of stages in flight.
    pub max_workers: usize,
    /// Behavior after a permanent stage failure.
    pub failure_mode: FailureMode,
    /// Retry policy for stages that do not set their own.
    pub default_retry: RetryPolicy,
    /// How long in-flight stages may keep running after cancellation.
    pub grace_period_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism().map_or(1, usize::from),
            failure_mode: FailureMode::FailFast,
            default_retry: RetryPolicy::default(),
            grace_period_ms: 5_000,
        }
    }
}

impl ExecutorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker limit. Zero is treated as one.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Sets the cancellation grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = millis(grace);
        self
    }

    /// Returns the cancellation grace period.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Runs pipeline graphs.
///
/// An executor can run any number of graphs, sequentially or concurrently.
/// Cancelling its token cancels every run in progress.
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

/// How a stage task ended.
#[derive(Debug)]
enum StageOutcome {
    Done(HashMap<String, Value>),
    Failed(StageError),
    Cancelled(String),
}

type StageTask = Pin<Box<dyn Future<Output = (usize, Result<StageOutcome, JoinError>)> + Send>>;

/// A dispatched stage task. Dropping it aborts the task, so stages never
/// outlive the `execute` future that spawned them.
struct InFlight {
    attempts: Arc<AtomicU32>,
    abort: AbortHandle,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

impl Executor {
    /// Creates an executor with a no-op event sink.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            sink: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Uses an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Returns the token that cancels this executor's runs.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Executes a graph with the given initial parameters.
    ///
    /// Stage failures and cancellation do not produce an `Err`: they end up
    /// in the returned record (see [`RunRecord::into_result`]).
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedInput` if a declared parameter is missing and
    /// `ContractMismatch` if one has the wrong type. Nothing runs in that case.
    pub async fn execute(
        &self,
        graph: &PipelineGraph,
        params: HashMap<String, Value>,
    ) -> PipelineResult<RunRecord> {
        let initial = validate_params(graph, params)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", pipeline = %graph.name(), run_id = %run_id);
        Run::new(self, graph, run_id, initial)
            .drive()
            .instrument(span)
            .await
    }
}

fn validate_params(
    graph: &PipelineGraph,
    mut params: HashMap<String, Value>,
) -> PipelineResult<HashMap<String, Value>> {
    let mut initial = HashMap::with_capacity(graph.params().len());
    for (key, ty) in graph.params() {
        let Some(value) = params.remove(key) else {
            return Err(PipelineError::UnresolvedInput {
                stage: PARAMS_PRODUCER.to_string(),
                key: key.clone(),
                reason: "declared parameter was not supplied".to_string(),
            });
        };
        if !ty.matches(&value) {
            return Err(PipelineError::ContractMismatch {
                stage: PARAMS_PRODUCER.to_string(),
                key: key.clone(),
                expected: *ty,
                found: ValueType::of(&value),
            });
        }
        initial.insert(key.clone(), value);
    }
    if !params.is_empty() {
        let mut extra: Vec<_> = params.into_keys().collect();
        extra.sort();
        debug!(pipeline = %graph.name(), ?extra, "ignoring undeclared parameters");
    }
    Ok(initial)
}

/// State of one `execute` call.
struct Run<'a> {
    executor: &'a Executor,
    graph: &'a PipelineGraph,
    run_id: Uuid,
    context: RunContext,
    /// Cancels this run only; fired when the executor token fires or a
    /// stage returns a cancel output.
    run_cancel: Arc<CancellationToken>,
    states: Vec<StageState>,
    records: Vec<StageRecord>,
    remaining_deps: Vec<usize>,
    ready: BTreeSet<usize>,
    in_flight: HashMap<usize, InFlight>,
    tasks: FuturesUnordered<StageTask>,
    completion_order: Vec<String>,
    /// The first cause that ended the run.
    terminal: Option<PipelineError>,
    cancelled: bool,
}

impl<'a> Run<'a> {
    fn new(
        executor: &'a Executor,
        graph: &'a PipelineGraph,
        run_id: Uuid,
        initial: HashMap<String, Value>,
    ) -> Self {
        let n = graph.len();
        let remaining_deps: Vec<usize> = (0..n).map(|idx| graph.upstream_of(idx).len()).collect();
        let ready: BTreeSet<usize> = (0..n).filter(|&idx| remaining_deps[idx] == 0).collect();
        let mut states = vec![StageState::Waiting; n];
        for &idx in &ready {
            states[idx] = StageState::Ready;
        }

        Self {
            executor,
            graph,
            run_id,
            context: RunContext::from_params(initial),
            run_cancel: Arc::new(CancellationToken::new()),
            states,
            records: graph.stages().iter().map(|s| StageRecord::new(&s.name)).collect(),
            remaining_deps,
            ready,
            in_flight: HashMap::new(),
            tasks: FuturesUnordered::new(),
            completion_order: Vec::new(),
            terminal: None,
            cancelled: false,
        }
    }

    fn emit(&self, event: &str, data: Value) {
        self.executor.sink.try_emit(event, Some(data));
    }

    fn fail_fast_tripped(&self) -> bool {
        self.executor.config.failure_mode == FailureMode::FailFast
            && matches!(self.terminal, Some(PipelineError::StageExecution { .. }))
    }

    async fn drive(mut self) -> PipelineResult<RunRecord> {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(stages = self.graph.len(), "pipeline run started");
        self.emit(
            events::RUN_STARTED,
            json!({
                "run_id": self.run_id,
                "pipeline": self.graph.name(),
                "stages": self.graph.len(),
            }),
        );

        loop {
            self.observe_cancellation();
            if !self.cancelled && !self.fail_fast_tripped() {
                self.dispatch_ready();
            }
            if self.cancelled {
                self.drain_with_grace().await;
                break;
            }
            if self.tasks.is_empty() {
                break;
            }

            let executor_cancel = self.executor.cancel.clone();
            let run_cancel = self.run_cancel.clone();
            tokio::select! {
                biased;
                () = async {
                    tokio::select! {
                        () = executor_cancel.cancelled() => {},
                        () = run_cancel.cancelled() => {},
                    }
                } => {}
                Some((idx, result)) = self.tasks.next() => self.handle_result(idx, result),
            }
        }

        self.settle_pending();

        let status = match &self.terminal {
            None => RunStatus::Succeeded,
            Some(PipelineError::Cancelled { .. }) => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };
        let duration_ms = millis(started.elapsed());
        match &self.terminal {
            None => info!(duration_ms, "pipeline run succeeded"),
            Some(err) => warn!(duration_ms, %status, error = %err, "pipeline run did not succeed"),
        }
        self.emit(
            events::RUN_COMPLETED,
            json!({
                "run_id": self.run_id,
                "pipeline": self.graph.name(),
                "status": status,
                "duration_ms": duration_ms,
            }),
        );

        Ok(RunRecord {
            run_id: self.run_id,
            pipeline: self.graph.name().to_string(),
            fingerprint: self.graph.fingerprint(),
            status,
            started_at,
            finished_at: Utc::now(),
            stages: self.records,
            completion_order: self.completion_order,
            context: self.context.to_map(),
            error: self.terminal,
        })
    }

    /// Picks up cancellation from the executor token or from a stage.
    fn observe_cancellation(&mut self) {
        if self.cancelled {
            return;
        }
        let reason = self
            .executor
            .cancel
            .reason()
            .or_else(|| self.run_cancel.reason());
        if let Some(reason) = reason {
            info!(%reason, "pipeline run cancelled");
            self.run_cancel.cancel(reason.clone());
            self.cancelled = true;
            if self.terminal.is_none() {
                self.terminal = Some(PipelineError::Cancelled { reason });
            }
        }
    }

    fn dispatch_ready(&mut self) {
        let max_workers = self.executor.config.max_workers.max(1);
        while self.in_flight.len() < max_workers {
            let Some(idx) = self.ready.pop_first() else {
                break;
            };
            self.spawn_stage(idx);
        }
    }

    fn spawn_stage(&mut self, idx: usize) {
        let spec = self.graph.stages()[idx].clone();
        let inputs = self.context.select(spec.inputs.keys());
        let policy = spec
            .retry
            .clone()
            .unwrap_or_else(|| self.executor.config.default_retry.clone());
        let attempts = Arc::new(AtomicU32::new(0));

        self.states[idx] = StageState::Running;
        self.records[idx].state = StageState::Running;
        self.records[idx].started_at = Some(Utc::now());

        let span = info_span!("stage", stage = %spec.name);
        let task = run_stage(StageRun {
            spec,
            inputs,
            policy,
            run_id: self.run_id,
            cancel: self.run_cancel.clone(),
            sink: self.executor.sink.clone(),
            attempts: attempts.clone(),
        })
        .instrument(span);

        let handle = tokio::spawn(task);
        self.in_flight.insert(
            idx,
            InFlight {
                attempts,
                abort: handle.abort_handle(),
            },
        );
        self.tasks.push(Box::pin(handle.map(move |result| (idx, result))));
    }

    fn handle_result(&mut self, idx: usize, result: Result<StageOutcome, JoinError>) {
        let attempts = self
            .in_flight
            .remove(&idx)
            .map_or(0, |f| f.attempts.load(Ordering::SeqCst));
        let name = self.graph.stages()[idx].name.clone();
        self.records[idx].attempts = attempts;
        self.records[idx].finished_at = Some(Utc::now());

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => StageOutcome::Cancelled("aborted after grace period".to_string()),
            Err(err) => StageOutcome::Failed(StageError::fatal(format!("stage task failed: {err}"))),
        };

        match outcome {
            StageOutcome::Done(outputs) => match self.context.commit(outputs) {
                Ok(()) => self.mark_done(idx, &name, attempts),
                Err(conflict) => self.mark_failed(idx, &name, attempts, StageError::fatal(conflict.to_string())),
            },
            StageOutcome::Failed(error) => self.mark_failed(idx, &name, attempts, error),
            StageOutcome::Cancelled(reason) => {
                self.states[idx] = StageState::Cancelled;
                self.records[idx].state = StageState::Cancelled;
                self.emit(events::STAGE_CANCELLED, json!({"stage": name, "reason": reason}));
                self.run_cancel.cancel(reason);
            }
        }
    }

    fn mark_done(&mut self, idx: usize, name: &str, attempts: u32) {
        self.states[idx] = StageState::Done;
        self.records[idx].state = StageState::Done;
        self.completion_order.push(name.to_string());
        debug!(stage = %name, attempts, "stage completed");
        self.emit(
            events::STAGE_COMPLETED,
            json!({
                "stage": name,
                "attempts": attempts,
                "duration_ms": self.records[idx].duration().map(millis),
            }),
        );

        for &next in self.graph.downstream_of(idx) {
            self.remaining_deps[next] -= 1;
            if self.remaining_deps[next] == 0 && self.states[next] == StageState::Waiting {
                self.states[next] = StageState::Ready;
                self.records[next].state = StageState::Ready;
                self.ready.insert(next);
            }
        }
    }

    fn mark_failed(&mut self, idx: usize, name: &str, attempts: u32, error: StageError) {
        warn!(stage = %name, attempts, error = %error, "stage failed");
        self.states[idx] = StageState::Failed;
        self.records[idx].state = StageState::Failed;
        self.records[idx].error = Some(error.message.clone());
        self.emit(
            events::STAGE_FAILED,
            json!({"stage": name, "attempts": attempts, "error": error.message}),
        );

        self.skip_downstream(idx, name);
        if self.terminal.is_none() {
            self.terminal = Some(PipelineError::StageExecution {
                stage: name.to_string(),
                attempts,
                source: error,
            });
        }
    }

    /// Marks every not-yet-started transitive consumer of `idx` as skipped.
    fn skip_downstream(&mut self, idx: usize, failed: &str) {
        let mut stack: Vec<usize> = self.graph.downstream_of(idx).to_vec();
        while let Some(next) = stack.pop() {
            if !self.states[next].is_pending() {
                continue;
            }
            self.ready.remove(&next);
            self.states[next] = StageState::Skipped;
            self.records[next].state = StageState::Skipped;
            let stage = &self.graph.stages()[next].name;
            self.emit(
                events::STAGE_SKIPPED,
                json!({"stage": stage, "reason": format!("upstream stage '{failed}' failed")}),
            );
            stack.extend(self.graph.downstream_of(next));
        }
    }

    /// Lets in-flight stages finish within the grace period, then aborts them.
    async fn drain_with_grace(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let grace = self.executor.config.grace_period();
        debug!(in_flight = self.tasks.len(), grace_ms = millis(grace), "draining in-flight stages");
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            match tokio::time::timeout_at(deadline, self.tasks.next()).await {
                Ok(Some((idx, result))) => self.handle_result(idx, result),
                Ok(None) => return,
                Err(_) => break,
            }
        }

        warn!(in_flight = self.in_flight.len(), "grace period expired, aborting stages");
        for in_flight in self.in_flight.values() {
            in_flight.abort.abort();
        }
        while let Some((idx, result)) = self.tasks.next().await {
            self.handle_result(idx, result);
        }
    }

    /// Gives every stage that never started its final state, following the
    /// cause that ended the run.
    fn settle_pending(&mut self) {
        let (state, event, reason) = if matches!(self.terminal, Some(PipelineError::Cancelled { .. })) {
            (StageState::Cancelled, events::STAGE_CANCELLED, "run cancelled")
        } else {
            (StageState::Skipped, events::STAGE_SKIPPED, "run stopped after a failure")
        };
        for idx in 0..self.states.len() {
            if self.states[idx].is_pending() {
                self.states[idx] = state;
                self.records[idx].state = state;
                let stage = &self.graph.stages()[idx].name;
                self.emit(event, json!({"stage": stage, "reason": reason}));
            }
        }
        self.ready.clear();
    }
}

/// Everything a stage task needs, owned.
struct StageRun {
    spec: StageSpec,
    inputs: HashMap<String, Value>,
    policy: RetryPolicy,
    run_id: Uuid,
    cancel: Arc<CancellationToken>,
    sink: Arc<dyn EventSink>,
    attempts: Arc<AtomicU32>,
}

async fn run_stage(run: StageRun) -> StageOutcome {
    let StageRun {
        spec,
        inputs,
        policy,
        run_id,
        cancel,
        sink,
        attempts,
    } = run;

    if let Err(error) = check_contract(&spec.inputs, &inputs, "input") {
        return StageOutcome::Failed(error);
    }

    let mut retry = RetryState::new();
    loop {
        let attempt = retry.begin_attempt();
        attempts.store(attempt, Ordering::SeqCst);
        sink.try_emit(
            events::STAGE_STARTED,
            Some(json!({"stage": spec.name, "attempt": attempt})),
        );
        debug!(attempt, "stage attempt started");

        let ctx = StageContext::new(&spec.name, run_id, attempt, inputs.clone(), cancel.clone());
        let output = AssertUnwindSafe(spec.runner.execute(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                StageOutput::fail_fatal(format!("stage panicked: {}", panic_message(payload.as_ref())))
            });

        let error = match output.status {
            OutputStatus::Ok => match check_contract(&spec.outputs, &output.data, "output") {
                Ok(()) => return StageOutcome::Done(output.data),
                Err(error) => error,
            },
            OutputStatus::Cancel => {
                return StageOutcome::Cancelled(output.cancel_reason.unwrap_or_else(|| "cancelled by stage".to_string()));
            }
            OutputStatus::Fail => output
                .stage_error()
                .unwrap_or_else(|| StageError::new("stage failed")),
        };

        match retry.on_failure(&policy, &error) {
            RetryDecision::Retry(delay) => {
                warn!(attempt, delay_ms = millis(delay), error = %error, "stage attempt failed, retrying");
                sink.try_emit(
                    events::STAGE_RETRYING,
                    Some(json!({
                        "stage": spec.name,
                        "attempt": attempt,
                        "delay_ms": millis(delay),
                        "error": error.message,
                    })),
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return StageOutcome::Cancelled(cancel.reason().unwrap_or_default());
                    }
                }
            }
            RetryDecision::GiveUp | RetryDecision::NotRetryable => return StageOutcome::Failed(error),
        }
    }
}

/// Checks values against a contract: every key present with a matching type
/// and nothing undeclared.
fn check_contract(
    contract: &crate::core::Contract,
    values: &HashMap<String, Value>,
    what: &str,
) -> Result<(), StageError> {
    for (key, ty) in contract {
        match values.get(key) {
            None => return Err(StageError::fatal(format!("missing declared {what} '{key}'"))),
            Some(value) if !ty.matches(value) => {
                return Err(StageError::fatal(format!(
                    "{what} '{key}' should be {ty}, got {}",
                    ValueType::of(value)
                )));
            }
            Some(_) => {}
        }
    }
    let mut extra: Vec<&str> = values
        .keys()
        .filter(|key| !contract.contains_key(*key))
        .map(String::as_str)
        .collect();
    if !extra.is_empty() {
        extra.sort_unstable();
        return Err(StageError::fatal(format!("undeclared {what}(s): {}", extra.join(", "))));
    }
    Ok(())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ValueType::{Array, Integer, Object};
    use crate::events::CollectingEventSink;
    use crate::pipeline::{StageRegistry, StageSpec};
    use crate::stages::FnStage;
    use crate::testing::{CountingStage, FailingStage, ProducerStage};

    fn executor() -> Executor {
        Executor::new(
            ExecutorConfig::new()
                .with_max_workers(4)
                .with_default_retry(RetryPolicy::none().with_base_delay_ms(1)),
        )
    }

    #[test]
    fn test_config_defaults_and_serde() {
        let config = ExecutorConfig::default();
        assert!(config.max_workers >= 1);
        assert_eq!(config.failure_mode, FailureMode::FailFast);
        assert_eq!(config.grace_period(), Duration::from_secs(5));

        let parsed: ExecutorConfig =
            serde_json::from_str(r#"{"max_workers": 2, "failure_mode": "continue_on_failure"}"#).unwrap();
        assert_eq!(parsed.max_workers, 2);
        assert_eq!(parsed.failure_mode, FailureMode::ContinueOnFailure);
        assert_eq!(parsed.default_retry, RetryPolicy::default());
    }

    #[test]
    fn test_check_contract() {
        let contract = crate::core::Contract::from([("x".to_string(), Integer)]);
        let ok = HashMap::from([("x".to_string(), json!(1))]);
        assert!(check_contract(&contract, &ok, "output").is_ok());

        let missing = HashMap::new();
        let err = check_contract(&contract, &missing, "output").unwrap_err();
        assert_eq!(err.message, "missing declared output 'x'");
        assert!(!err.retryable);

        let wrong = HashMap::from([("x".to_string(), json!("one"))]);
        let err = check_contract(&contract, &wrong, "input").unwrap_err();
        assert_eq!(err.message, "input 'x' should be integer, got string");

        let extra = HashMap::from([("x".to_string(), json!(1)), ("y".to_string(), json!(2))]);
        let err = check_contract(&contract, &extra, "output").unwrap_err();
        assert_eq!(err.message, "undeclared output(s): y");
    }

    #[tokio::test]
    async fn test_missing_param_rejected_before_run() {
        let counter = CountingStage::new("load");
        let mut registry = StageRegistry::new("p");
        registry.declare_param("uri", ValueType::String);
        registry
            .register(StageSpec::from_stage(counter.clone()).with_input("uri", ValueType::String))
            .unwrap();
        let graph = registry.build().unwrap();

        let err = executor().execute(&graph, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedInput { key, .. } if key == "uri"));

        let err = executor()
            .execute(&graph, HashMap::from([("uri".to_string(), json!(5))]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ContractMismatch { .. }));
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_undeclared_output_fails_stage() {
        let load = ProducerStage::new("load", [("raw", json!([1])), ("extra", json!(true))]);
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(load).with_output("raw", Array))
            .unwrap()
            .build()
            .unwrap();

        let record = executor().execute(&graph, HashMap::new()).await.unwrap();
        assert_eq!(record.status(), RunStatus::Failed);
        assert!(record.get("raw").is_none());
        assert!(record.stage("load").unwrap().error.as_deref().unwrap().contains("extra"));
    }

    #[tokio::test]
    async fn test_any_producer_checked_at_dispatch() {
        let load = ProducerStage::new("load", [("raw", json!("text"))]);
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(load).with_output("raw", ValueType::Any))
            .unwrap()
            .with_stage(StageSpec::from_stage(CountingStage::new("train")).with_input("raw", Array))
            .unwrap()
            .build()
            .unwrap();

        let record = executor().execute(&graph, HashMap::new()).await.unwrap();
        assert_eq!(record.state_of("load"), Some(StageState::Done));
        assert_eq!(record.state_of("train"), Some(StageState::Failed));
        assert_eq!(record.stage("train").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_a_failure() {
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(FnStage::new("boom", |_| panic!("kaboom"))))
            .unwrap()
            .build()
            .unwrap();

        let record = executor().execute(&graph, HashMap::new()).await.unwrap();
        assert_eq!(record.status(), RunStatus::Failed);
        assert_eq!(
            record.stage("boom").unwrap().error.as_deref(),
            Some("stage panicked: kaboom")
        );
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_independent_branches() {
        let independent = CountingStage::new("report");
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(FailingStage::new("load")).with_output("raw", Array))
            .unwrap()
            .with_stage(StageSpec::from_stage(CountingStage::new("train")).with_input("raw", Array))
            .unwrap()
            .with_stage(StageSpec::from_stage(independent.clone()))
            .unwrap()
            .build()
            .unwrap();

        let executor = Executor::new(
            ExecutorConfig::new()
                .with_max_workers(1)
                .with_failure_mode(FailureMode::ContinueOnFailure),
        );
        let record = executor.execute(&graph, HashMap::new()).await.unwrap();
        assert_eq!(record.status(), RunStatus::Failed);
        assert_eq!(record.state_of("train"), Some(StageState::Skipped));
        assert_eq!(record.state_of("report"), Some(StageState::Done));
        assert_eq!(independent.calls(), 1);

        let fail_fast = Executor::new(ExecutorConfig::new().with_max_workers(1));
        let skipped = CountingStage::new("report");
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(FailingStage::new("load")))
            .unwrap()
            .with_stage(StageSpec::from_stage(skipped.clone()))
            .unwrap()
            .build()
            .unwrap();
        let record = fail_fast.execute(&graph, HashMap::new()).await.unwrap();
        assert_eq!(record.state_of("report"), Some(StageState::Skipped));
        assert_eq!(skipped.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_failure_keeps_failure_labels() {
        use crate::testing::SlowStage;

        let report = CountingStage::new("report");
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(FailingStage::new("load").fatal()))
            .unwrap()
            .with_stage(
                StageSpec::from_stage(SlowStage::new("train", Duration::from_millis(100)).with_value("model", json!(1)))
                    .with_output("model", Integer),
            )
            .unwrap()
            .with_stage(StageSpec::from_stage(report.clone()).with_input("model", Integer))
            .unwrap()
            .build()
            .unwrap();

        let executor = Executor::new(
            ExecutorConfig::new()
                .with_max_workers(2)
                .with_grace_period(Duration::from_secs(5)),
        );
        let token = executor.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel("shutdown");
        });

        let record = executor.execute(&graph, HashMap::new()).await.unwrap();
        assert_eq!(record.status(), RunStatus::Failed);
        assert_eq!(record.state_of("load"), Some(StageState::Failed));
        assert_eq!(record.state_of("train"), Some(StageState::Done));
        assert_eq!(record.state_of("report"), Some(StageState::Skipped));
        assert_eq!(report.calls(), 0);
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let sink = Arc::new(CollectingEventSink::new());
        let load = ProducerStage::new("load", [("raw", json!([1]))]);
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(load).with_output("raw", Array))
            .unwrap()
            .with_stage(
                StageSpec::from_stage(ProducerStage::new("train", [("model", json!({}))]))
                    .with_input("raw", Array)
                    .with_output("model", Object),
            )
            .unwrap()
            .build()
            .unwrap();

        let record = executor()
            .with_event_sink(sink.clone())
            .execute(&graph, HashMap::new())
            .await
            .unwrap();
        assert!(record.is_success());
        assert_eq!(
            sink.names(),
            vec![
                "run.started",
                "stage.started",
                "stage.completed",
                "stage.started",
                "stage.completed",
                "run.completed",
            ]
        );
    }
}
