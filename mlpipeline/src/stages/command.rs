//! Stages that run an external program.

use super::Stage;
use crate::context::StageContext;
use crate::core::StageOutput;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs a program once per attempt.
///
/// The stage inputs are written to the program's stdin as one JSON object.
/// Whatever the program prints to stdout must be a JSON object (or nothing);
/// its entries become the stage outputs. A non-zero exit status fails the
/// attempt with the captured stderr.
///
/// The child sees `MLPIPELINE_STAGE`, `MLPIPELINE_RUN_ID` and
/// `MLPIPELINE_ATTEMPT` in its environment. On cancellation it keeps running
/// until the executor's grace period runs out and the stage task is aborted,
/// which kills it. [`CommandStage::kill_on_cancel`] kills it right away instead.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    kill_on_cancel: bool,
}

impl CommandStage {
    /// Creates a command stage.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            kill_on_cancel: false,
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the child's working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kills the child as soon as the run is cancelled.
    #[must_use]
    pub fn kill_on_cancel(mut self, kill: bool) -> Self {
        self.kill_on_cancel = kill;
        self
    }

    /// Returns the program to run.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the program arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self, ctx: &StageContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("MLPIPELINE_STAGE", ctx.stage_name())
            .env("MLPIPELINE_RUN_ID", ctx.run_id().to_string())
            .env("MLPIPELINE_ATTEMPT", ctx.attempt().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(&self, ctx: &StageContext) -> StageOutput {
        let payload = match serde_json::to_vec(&sorted_inputs(ctx.inputs())) {
            Ok(bytes) => bytes,
            Err(e) => return StageOutput::fail_fatal(format!("encoding inputs: {e}")),
        };

        let mut child = match self.command(ctx).spawn() {
            Ok(child) => child,
            Err(e) => {
                return StageOutput::fail_fatal(format!("failed to spawn '{}': {e}", self.program));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // A child that never reads stdin must not block the stage.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "child closed stdin early");
                }
            });
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => return StageOutput::fail(format!("waiting for '{}': {e}", self.program)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return StageOutput::fail(format!(
                "'{}' exited with status {code}: {}",
                self.program,
                stderr.trim()
            ));
        }

        parse_stdout(&output.stdout)
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        debug!(stage = %self.name, program = %self.program, attempt = ctx.attempt(), "spawning command");
        if !self.kill_on_cancel {
            return self.run(ctx).await;
        }
        tokio::select! {
            output = self.run(ctx) => output,
            () = ctx.cancellation().cancelled() => {
                StageOutput::cancel(ctx.cancellation().reason().unwrap_or_default())
            }
        }
    }
}

fn sorted_inputs(inputs: &HashMap<String, Value>) -> Map<String, Value> {
    inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn parse_stdout(stdout: &[u8]) -> StageOutput {
    let text = String::from_utf8_lossy(stdout);
    if text.trim().is_empty() {
        return StageOutput::ok_empty();
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => StageOutput::ok(map.into_iter().collect()),
        Ok(other) => StageOutput::fail_fatal(format!(
            "expected a JSON object on stdout, got {}",
            crate::core::ValueType::of(&other)
        )),
        Err(e) => StageOutput::fail_fatal(format!("stdout is not valid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_stdout() {
        assert!(parse_stdout(b"  \n").data.is_empty());

        let ok = parse_stdout(br#"{"model": {"w": 1}}"#);
        assert_eq!(ok.get("model"), Some(&json!({"w": 1})));

        let not_object = parse_stdout(b"[1, 2]");
        assert!(not_object.is_failure());
        assert!(!not_object.retryable);

        let garbage = parse_stdout(b"hello");
        assert!(garbage.error.unwrap().contains("not valid JSON"));
    }

    #[test]
    fn test_builder() {
        let stage = CommandStage::new("train", "python")
            .with_args(["train.py", "--epochs", "3"])
            .with_env("SEED", "7");
        assert_eq!(stage.name(), "train");
        assert_eq!(stage.program(), "python");
        assert_eq!(stage.args().len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inputs_round_trip_through_child() {
        let stage = CommandStage::new("echo", "cat");
        let ctx = StageContext::detached("echo", HashMap::from([("rows".to_string(), json!([1, 2, 3]))]));

        let output = stage.execute(&ctx).await;
        assert!(output.is_success(), "{:?}", output.error);
        assert_eq!(output.get("rows"), Some(&json!([1, 2, 3])));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_retryable_failure() {
        let stage = CommandStage::new("boom", "sh").with_args(["-c", "echo boom >&2; exit 3"]);
        let output = stage.execute(&StageContext::detached("boom", HashMap::new())).await;

        assert!(output.is_failure());
        assert!(output.retryable);
        let error = output.error.unwrap();
        assert!(error.contains("status 3"));
        assert!(error.contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_exposes_stage_name() {
        let stage = CommandStage::new("env", "sh")
            .with_args(["-c", r#"printf '{"stage": "%s", "seed": "%s"}' "$MLPIPELINE_STAGE" "$SEED""#])
            .with_env("SEED", "42");
        let output = stage.execute(&StageContext::detached("env", HashMap::new())).await;

        assert_eq!(output.get("stage"), Some(&json!("env")));
        assert_eq!(output.get("seed"), Some(&json!("42")));
    }

    #[cfg(unix)]
    fn cancelled_run(stage: CommandStage) -> (crate::pipeline::Executor, crate::pipeline::PipelineGraph) {
        use crate::pipeline::{Executor, ExecutorConfig, StageRegistry, StageSpec};
        use std::time::Duration;

        let executor = Executor::new(ExecutorConfig::new().with_grace_period(Duration::from_secs(5)));
        let token = executor.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel("shutdown");
        });
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(stage))
            .unwrap()
            .build()
            .unwrap();
        (executor, graph)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_finishes_within_grace_period() {
        use crate::core::{RunStatus, StageState};
        use std::time::{Duration, Instant};

        let stage = CommandStage::new("fit", "sh").with_args(["-c", "sleep 0.3; echo '{}'"]);
        let (executor, graph) = cancelled_run(stage);

        let started = Instant::now();
        let record = executor.execute(&graph, HashMap::new()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(record.status(), RunStatus::Cancelled);
        assert_eq!(record.state_of("fit"), Some(StageState::Done));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_on_cancel_stops_command_immediately() {
        use crate::core::StageState;
        use std::time::{Duration, Instant};

        let stage = CommandStage::new("fit", "sh")
            .with_args(["-c", "sleep 5; echo '{}'"])
            .kill_on_cancel(true);
        let (executor, graph) = cancelled_run(stage);

        let started = Instant::now();
        let record = executor.execute(&graph, HashMap::new()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(record.state_of("fit"), Some(StageState::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let stage = CommandStage::new("ghost", "/definitely/not/a/program");
        let output = stage.execute(&StageContext::detached("ghost", HashMap::new())).await;
        assert!(output.is_failure());
        assert!(!output.retryable);
    }
}
