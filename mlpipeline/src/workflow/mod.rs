//! Named workflows and selective, concurrent execution.
//!
//! A workflow wraps a validated [`PipelineGraph`] with an id, a display name
//! and default parameters. The registry runs any subset of its workflows on
//! one executor at the same time.

use crate::errors::{PipelineError, PipelineResult};
use crate::pipeline::{Executor, PipelineGraph, RunRecord};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

/// Minimum length of a workflow id.
pub const MIN_WORKFLOW_ID_LEN: usize = 2;

/// A runnable, named pipeline.
#[derive(Debug, Clone)]
pub struct Workflow {
    id: String,
    name: String,
    description: Option<String>,
    graph: Arc<PipelineGraph>,
    defaults: HashMap<String, Value>,
}

impl Workflow {
    /// Creates a workflow named after its id.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the id is shorter than two characters or contains
    /// whitespace.
    pub fn new(id: impl Into<String>, graph: PipelineGraph) -> PipelineResult<Self> {
        let id = id.into();
        if id.chars().count() < MIN_WORKFLOW_ID_LEN || id.chars().any(char::is_whitespace) {
            return Err(PipelineError::Config(format!(
                "workflow id '{id}' must be at least {MIN_WORKFLOW_ID_LEN} characters without whitespace"
            )));
        }
        Ok(Self {
            name: id.clone(),
            id,
            description: None,
            graph: Arc::new(graph),
            defaults: HashMap::new(),
        })
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets a default parameter value, used when a run does not supply it.
    #[must_use]
    pub fn with_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    /// Returns the id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the validated graph.
    #[must_use]
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Returns the default parameters.
    #[must_use]
    pub fn defaults(&self) -> &HashMap<String, Value> {
        &self.defaults
    }

    /// Merges run parameters over the defaults.
    fn params_for(&self, params: &HashMap<String, Value>) -> HashMap<String, Value> {
        let mut merged = self.defaults.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Runs this workflow.
    ///
    /// # Errors
    ///
    /// Same as [`Executor::execute`].
    pub async fn run(
        &self,
        executor: &Executor,
        params: &HashMap<String, Value>,
    ) -> PipelineResult<RunRecord> {
        info!(workflow = %self.id, "running workflow");
        executor.execute(&self.graph, self.params_for(params)).await
    }
}

/// The outcome of one workflow within [`WorkflowRegistry::run`].
#[derive(Debug)]
pub struct WorkflowRun {
    /// The workflow id.
    pub workflow: String,
    /// The run record, or the error that kept the run from starting.
    pub outcome: PipelineResult<RunRecord>,
}

impl WorkflowRun {
    /// Returns true if the workflow ran and succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(&self.outcome, Ok(record) if record.is_success())
    }
}

/// Workflows keyed by id.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Workflow>,
}

impl WorkflowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateWorkflow` if the id is taken.
    pub fn register(&mut self, workflow: Workflow) -> PipelineResult<()> {
        if self.workflows.contains_key(&workflow.id) {
            return Err(PipelineError::DuplicateWorkflow { id: workflow.id });
        }
        self.workflows.insert(workflow.id.clone(), workflow);
        Ok(())
    }

    /// Looks up a workflow by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Workflow> {
        self.workflows.get(id)
    }

    /// Returns every workflow, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<&Workflow> {
        self.workflows.values().collect()
    }

    /// Returns the number of workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Returns true if no workflow is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Resolves a selection into workflows, sorted by id and deduplicated.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchWorkflows` listing every unknown id.
    pub fn select(&self, select: Option<&[&str]>) -> PipelineResult<Vec<&Workflow>> {
        let Some(ids) = select else {
            return Ok(self.list());
        };
        let ids: BTreeSet<&str> = ids.iter().copied().collect();
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !self.workflows.contains_key(**id))
            .map(|id| (*id).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::NoSuchWorkflows { missing });
        }
        Ok(ids.into_iter().filter_map(|id| self.workflows.get(id)).collect())
    }

    /// Runs the selected workflows concurrently (all of them for `None`).
    ///
    /// Every workflow gets the same run parameters merged over its own
    /// defaults. Results come back in id order.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchWorkflows` before running anything if a selected id is
    /// unknown.
    pub async fn run(
        &self,
        executor: &Executor,
        select: Option<&[&str]>,
        params: &HashMap<String, Value>,
    ) -> PipelineResult<Vec<WorkflowRun>> {
        let selected = self.select(select)?;
        info!(workflows = selected.len(), "running workflows");

        let runs = selected.into_iter().map(|workflow| async move {
            WorkflowRun {
                workflow: workflow.id.clone(),
                outcome: workflow.run(executor, params).await,
            }
        });
        Ok(join_all(runs).await)
    }
}
