//! Command handlers.

use crate::cli::{Cli, Commands, RunArgs};
use anyhow::Context;
use mlpipeline::config::{load_config, AppConfig};
use mlpipeline::errors::PipelineError;
use mlpipeline::events::LoggingEventSink;
use mlpipeline::pipeline::{Executor, RunRecord};
use mlpipeline::workflow::{WorkflowRegistry, WorkflowRun};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, warn};

/// A workflow failed or was cancelled.
pub const EXIT_FAILED: u8 = 1;
/// The configuration file could not be read or parsed.
pub const EXIT_CONFIG_LOAD: u8 = 2;
/// The configuration describes an invalid workflow.
pub const EXIT_CONFIG_INVALID: u8 = 3;
/// Anything else.
pub const EXIT_RUNTIME: u8 = 5;

/// A command failure and the exit code it maps to.
#[derive(Debug)]
pub enum CliError {
    Load(anyhow::Error),
    Invalid(anyhow::Error),
    Runtime(anyhow::Error),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Load(_) => EXIT_CONFIG_LOAD,
            Self::Invalid(_) => EXIT_CONFIG_INVALID,
            Self::Runtime(_) => EXIT_RUNTIME,
        }
    }

    fn error(&self) -> &anyhow::Error {
        match self {
            Self::Load(e) | Self::Invalid(e) | Self::Runtime(e) => e,
        }
    }
}

type CommandResult = Result<ExitCode, CliError>;

/// Runs the selected command and reports failures on stderr.
pub async fn dispatch(cli: Cli) -> ExitCode {
    let result = match &cli.command {
        Commands::Run(args) => run(&cli, args).await,
        Commands::List => list(&cli),
        Commands::Graph { workflow } => graph(&cli, workflow),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err.error(), "command failed");
            eprintln!("error: {:#}", err.error());
            if let Some(hint) = fix_hint(err.error()) {
                eprintln!("hint: {hint}");
            }
            ExitCode::from(err.exit_code())
        }
    }
}

/// The fix hint of the definition error behind `err`, if any.
fn fix_hint(err: &anyhow::Error) -> Option<String> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .and_then(PipelineError::error_info)
        .and_then(|info| info.fix_hint)
}

fn load(cli: &Cli) -> Result<(AppConfig, WorkflowRegistry), CliError> {
    let config = load_config(&cli.config, cli.config_format)
        .with_context(|| format!("loading configuration from '{}'", cli.config.display()))
        .map_err(CliError::Load)?;
    let registry = config
        .build_registry()
        .with_context(|| format!("invalid workflow definition in '{}'", cli.config.display()))
        .map_err(CliError::Invalid)?;
    Ok((config, registry))
}

fn list(cli: &Cli) -> CommandResult {
    let (_, registry) = load(cli)?;
    if registry.is_empty() {
        println!("No workflows configured.");
        return Ok(ExitCode::SUCCESS);
    }
    for workflow in registry.list() {
        let stages = workflow.graph().len();
        match workflow.description() {
            Some(description) => println!(
                "{}\t{}\t{stages} stage(s)\t{description}",
                workflow.id(),
                workflow.name()
            ),
            None => println!("{}\t{}\t{stages} stage(s)", workflow.id(), workflow.name()),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn graph(cli: &Cli, id: &str) -> CommandResult {
    let (_, registry) = load(cli)?;
    let workflow = registry
        .select(Some(std::slice::from_ref(&id)))
        .map_err(|e| CliError::Runtime(e.into()))?
        .into_iter()
        .next()
        .ok_or_else(|| CliError::Runtime(anyhow::anyhow!("workflow '{id}' not found")))?;

    println!("{}", workflow.graph().describe());
    println!("Fingerprint: {}", workflow.graph().fingerprint());
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: &Cli, args: &RunArgs) -> CommandResult {
    let (config, registry) = load(cli)?;
    let executor = Executor::new(config.executor).with_event_sink(Arc::new(LoggingEventSink::debug()));

    let token = executor.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling runs");
            token.cancel("interrupted");
        }
    });

    let select: Option<Vec<&str>> =
        (!args.select.is_empty()).then(|| args.select.iter().map(String::as_str).collect());
    let params: HashMap<String, Value> = args.params.iter().cloned().collect();
    let outcome = registry.run(&executor, select.as_deref(), &params).await;
    interrupt.abort();
    let runs = outcome.map_err(|e| CliError::Runtime(e.into()))?;

    for run in &runs {
        print_summary(run, cli.verbose);
    }
    if let Some(path) = &args.report {
        write_report(path, &runs).map_err(CliError::Runtime)?;
    }

    if runs.iter().all(WorkflowRun::is_success) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILED))
    }
}

fn print_summary(run: &WorkflowRun, verbosity: u8) {
    match &run.outcome {
        Ok(record) => {
            let done = record.completion_order().len();
            println!(
                "{}: {} ({done}/{} stages done, {} ms)",
                run.workflow,
                record.status(),
                record.stages.len(),
                record.duration().as_millis()
            );
            if let Some(err) = record.error() {
                println!("  {err}");
            }
            if verbosity > 0 {
                for stage in &record.stages {
                    let ms = stage.duration().map_or(0, |d| d.as_millis());
                    println!("  - {}: {} ({} attempt(s), {ms} ms)", stage.name, stage.state, stage.attempts);
                }
            }
        }
        Err(err) => {
            println!("{}: not started", run.workflow);
            println!("  {err}");
        }
    }
}

fn report_entry(run: &WorkflowRun) -> anyhow::Result<Value> {
    match &run.outcome {
        Ok(record) => serialize_record(record),
        Err(err) => Ok(json!({
            "pipeline": run.workflow,
            "status": "not_started",
            "error": err.to_string(),
        })),
    }
}

fn serialize_record(record: &RunRecord) -> anyhow::Result<Value> {
    serde_json::to_value(record).context("serializing run record")
}

fn write_report(path: &Path, runs: &[WorkflowRun]) -> anyhow::Result<()> {
    let entries = runs.iter().map(report_entry).collect::<anyhow::Result<Vec<_>>>()?;
    let text = serde_json::to_string_pretty(&entries).context("serializing report")?;
    std::fs::write(path, text).with_context(|| format!("writing report to '{}'", path.display()))
}
