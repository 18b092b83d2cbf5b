//! Workflow configuration files.
//!
//! A configuration file (TOML or YAML) holds the executor settings and a list
//! of workflows whose stages are external commands:
//!
//! ```toml
//! [executor]
//! max_workers = 4
//! failure_mode = "continue_on_failure"
//!
//! [[workflows]]
//! id = "training"
//! params = { source = { type = "string", default = "data.csv" } }
//!
//! [[workflows.stages]]
//! name = "load"
//! command = "python3"
//! args = ["load.py"]
//! inputs = { source = "string" }
//! outputs = { raw = "array" }
//! retry = { max_retries = 2, backoff = "linear" }
//! ```

use crate::core::{StageKind, ValueType};
use crate::errors::{PipelineError, PipelineResult};
use crate::pipeline::{ExecutorConfig, RetryPolicy, StageRegistry, StageSpec};
use crate::stages::CommandStage;
use crate::workflow::{Workflow, WorkflowRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    /// Pick by file extension, falling back to TOML.
    #[default]
    Auto,
    /// TOML.
    Toml,
    /// YAML.
    Yaml,
}

impl ConfigFormat {
    /// Resolves `Auto` against a file path.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => Self::Yaml,
                _ => Self::Toml,
            },
            explicit => explicit,
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Toml => write!(f, "toml"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}

impl FromStr for ConfigFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(PipelineError::Config(format!(
                "unknown config format '{other}' (expected auto, toml or yaml)"
            ))),
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Workflow definitions.
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
}

/// One workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Unique id, at least two characters.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared initial parameters.
    #[serde(default)]
    pub params: BTreeMap<String, ParamConfig>,
    /// Stages, in registration order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// A declared initial parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamConfig {
    /// Expected type.
    #[serde(rename = "type", default)]
    pub ty: ValueType,
    /// Value used when a run does not supply one.
    #[serde(default)]
    pub default: Option<Value>,
}

/// An explicit dependency on another stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyConfig {
    /// The producing stage.
    pub stage: String,
    /// The input key taken from that stage; without one the dependency only
    /// orders the two stages.
    #[serde(default)]
    pub key: Option<String>,
}

/// One command stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Unique stage name.
    pub name: String,
    /// Program to run.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Input contract.
    #[serde(default)]
    pub inputs: BTreeMap<String, ValueType>,
    /// Output contract.
    #[serde(default)]
    pub outputs: BTreeMap<String, ValueType>,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<DependencyConfig>,
    /// Retry policy; the executor default applies when unset.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Kind of work.
    #[serde(default)]
    pub kind: StageKind,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Kill the program as soon as the run is cancelled instead of letting
    /// it use the grace period.
    #[serde(default)]
    pub kill_on_cancel: bool,
}

impl StageConfig {
    fn to_spec(&self) -> StageSpec {
        let mut stage = CommandStage::new(&self.name, &self.command)
            .with_args(self.args.iter().cloned())
            .kill_on_cancel(self.kill_on_cancel);
        for (key, value) in &self.env {
            stage = stage.with_env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            stage = stage.with_working_dir(dir);
        }

        let mut spec = StageSpec::new(&self.name, Arc::new(stage)).with_kind(self.kind);
        spec.inputs.extend(self.inputs.iter().map(|(k, ty)| (k.clone(), *ty)));
        spec.outputs.extend(self.outputs.iter().map(|(k, ty)| (k.clone(), *ty)));
        spec.retry.clone_from(&self.retry);
        spec.description.clone_from(&self.description);
        spec
    }
}

impl WorkflowConfig {
    /// Validates this definition into a workflow.
    ///
    /// # Errors
    ///
    /// Returns the first definition error of the stage graph, or `Config`
    /// for an invalid id or a default that does not match its parameter type.
    pub fn to_workflow(&self) -> PipelineResult<Workflow> {
        let mut registry = StageRegistry::new(&self.id);
        for (key, param) in &self.params {
            registry.declare_param(key, param.ty);
        }
        for stage in &self.stages {
            registry.register(stage.to_spec())?;
        }
        for stage in &self.stages {
            for dep in &stage.depends_on {
                registry.declare_dependency(&dep.stage, &stage.name, dep.key.clone().unwrap_or_default())?;
            }
        }
        let graph = registry.build()?;

        let mut workflow = Workflow::new(&self.id, graph)?;
        if let Some(name) = &self.name {
            workflow = workflow.with_name(name);
        }
        if let Some(description) = &self.description {
            workflow = workflow.with_description(description);
        }
        for (key, param) in &self.params {
            if let Some(value) = &param.default {
                if !param.ty.matches(value) {
                    return Err(PipelineError::Config(format!(
                        "default for parameter '{key}' of workflow '{}' should be {}, got {}",
                        self.id,
                        param.ty,
                        ValueType::of(value)
                    )));
                }
                workflow = workflow.with_default(key, value.clone());
            }
        }
        Ok(workflow)
    }
}

impl AppConfig {
    /// Builds every configured workflow.
    ///
    /// # Errors
    ///
    /// Returns the first invalid workflow's error, or `DuplicateWorkflow`.
    pub fn build_registry(&self) -> PipelineResult<WorkflowRegistry> {
        let mut registry = WorkflowRegistry::new();
        for config in &self.workflows {
            registry.register(config.to_workflow()?)?;
            debug!(workflow = %config.id, stages = config.stages.len(), "loaded workflow");
        }
        Ok(registry)
    }
}

/// Parses configuration text.
///
/// # Errors
///
/// Returns `Config` if the text is not valid for the format.
pub fn parse_config(content: &str, format: ConfigFormat) -> PipelineResult<AppConfig> {
    match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| PipelineError::Config(format!("invalid YAML: {e}")))
        }
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(content).map_err(|e| PipelineError::Config(format!("invalid TOML: {e}")))
        }
    }
}

/// Reads and parses a configuration file.
///
/// # Errors
///
/// Returns `Io` if the file cannot be read and `Config` if it cannot be
/// parsed.
pub fn load_config(path: &Path, format: ConfigFormat) -> PipelineResult<AppConfig> {
    let format = format.resolve(path);
    debug!(path = %path.display(), %format, "loading configuration");
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, format)
}
