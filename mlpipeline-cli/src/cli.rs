//! Command line definition.

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use mlpipeline::config::ConfigFormat;
use serde_json::Value;
use std::path::PathBuf;
use tracing::Level;

/// Define and run ML workflows.
#[derive(Parser, Debug)]
#[command(
    name = "mlpipeline",
    version,
    about = "Run ML workflows defined as typed stage graphs",
    after_help = "Examples:\n\
        mlpipeline -c workflows.toml list                 List configured workflows\n\
        mlpipeline -c workflows.toml graph training       Show an execution plan\n\
        mlpipeline -c workflows.toml run --select training --param epochs=10"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "ML_PIPELINE_CONFIG",
        default_value = "mlpipeline.toml",
        value_name = "PATH"
    )]
    pub config: PathBuf,

    /// Configuration file format
    #[arg(long, global = true, env = "ML_PIPELINE_CONFIG_FORMAT", default_value = "auto")]
    pub config_format: ConfigFormat,

    /// Log level
    #[arg(
        short,
        long,
        global = true,
        env = "ML_PIPELINE_LOG_LEVEL",
        value_enum,
        ignore_case = true,
        default_value = "warn"
    )]
    pub log_level: LogLevel,

    /// Print more detail on stdout (repeatable); independent of the log level
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run workflows
    Run(RunArgs),

    /// List configured workflows
    List,

    /// Print the execution plan of a workflow
    Graph {
        /// Workflow id
        workflow: String,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run only these workflows (all when omitted)
    #[arg(short, long = "select", value_name = "ID")]
    pub select: Vec<String>,

    /// Initial parameter as KEY=JSON (plain text is taken as a string)
    #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// Write the run records as JSON to this file
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    #[value(alias = "notset")]
    Trace,
    Debug,
    Info,
    #[value(alias = "warning")]
    Warn,
    #[value(alias = "critical")]
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("parameter '{raw}' has an empty key"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
