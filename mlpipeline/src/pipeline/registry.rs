//! Stage registration and graph validation.

use super::graph::{Binding, InputSource, PipelineGraph};
use super::StageSpec;
use crate::core::{Contract, ValueType};
use crate::errors::{CycleDetectedError, PipelineError, PipelineResult};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;
use tracing::debug;

static STAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("stage name regex should compile")
});

/// Producer label used when a stage output collides with a declared parameter.
pub const PARAMS_PRODUCER: &str = "<initial parameters>";

/// Mutable definition of a pipeline.
///
/// Stages are registered with their input and output contracts; edges are
/// derived from matching keys when [`StageRegistry::build`] validates the
/// definition and freezes it into a [`PipelineGraph`].
#[derive(Debug, Clone)]
pub struct StageRegistry {
    name: String,
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
    bindings: Vec<Binding>,
    params: Contract,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            index: HashMap::new(),
            bindings: Vec::new(),
            params: Contract::new(),
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns true if a stage with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Registers a stage.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStageName` for an empty or malformed name and
    /// `DuplicateStage` if the name is taken.
    pub fn register(&mut self, spec: StageSpec) -> PipelineResult<()> {
        validate_stage_name(&spec.name)?;
        if self.index.contains_key(&spec.name) {
            return Err(PipelineError::DuplicateStage { name: spec.name });
        }
        debug!(pipeline = %self.name, stage = %spec.name, "registered stage");
        self.index.insert(spec.name.clone(), self.stages.len());
        self.stages.push(spec);
        Ok(())
    }

    /// Registers a stage, builder style.
    ///
    /// # Errors
    ///
    /// Same as [`StageRegistry::register`].
    pub fn with_stage(mut self, spec: StageSpec) -> PipelineResult<Self> {
        self.register(spec)?;
        Ok(self)
    }

    /// Declares that `consumer` takes `key` from `producer`.
    ///
    /// The consumer always runs after the producer. If the consumer declares
    /// `key` as an input, the producer must declare it as an output; if not,
    /// the edge only orders the two stages.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if either stage is not registered.
    pub fn declare_dependency(
        &mut self,
        producer: &str,
        consumer: &str,
        key: impl Into<String>,
    ) -> PipelineResult<()> {
        let producer = self.position(producer)?;
        let consumer = self.position(consumer)?;
        self.bindings.push(Binding {
            producer,
            consumer,
            key: key.into(),
        });
        Ok(())
    }

    /// Declares an initial parameter that `execute` must be given.
    pub fn declare_param(&mut self, key: impl Into<String>, ty: ValueType) {
        self.params.insert(key.into(), ty);
    }

    /// Validates the definition and freezes it.
    ///
    /// Checks run in this order, and the first failure is returned:
    /// empty pipeline, output conflicts, unresolved inputs, contract
    /// mismatches, cycles.
    ///
    /// # Errors
    ///
    /// Returns the first definition error found. No partial graph is built.
    pub fn build(&self) -> PipelineResult<PipelineGraph> {
        if self.stages.is_empty() {
            return Err(PipelineError::EmptyPipeline {
                pipeline: self.name.clone(),
            });
        }

        let producers = self.check_output_conflicts()?;
        let sources = self.resolve_inputs(&producers)?;
        self.check_contracts(&sources)?;

        let n = self.stages.len();
        let mut upstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for (consumer, resolved) in sources.iter().enumerate() {
            for source in resolved.values() {
                if let InputSource::Stage(producer) = source {
                    upstream[consumer].insert(*producer);
                }
            }
        }
        for binding in &self.bindings {
            upstream[binding.consumer].insert(binding.producer);
        }

        let mut downstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for (consumer, producers) in upstream.iter().enumerate() {
            for &producer in producers {
                downstream[producer].insert(consumer);
            }
        }

        if let Some(cycle) = self.find_cycle(&downstream) {
            return Err(CycleDetectedError::new(cycle).into());
        }

        let order = topological_order(&upstream, &downstream);
        debug!(pipeline = %self.name, stages = n, "built pipeline graph");

        Ok(PipelineGraph {
            name: self.name.clone(),
            stages: self.stages.clone(),
            index: self.index.clone(),
            upstream: upstream.into_iter().map(|s| s.into_iter().collect()).collect(),
            downstream: downstream.into_iter().map(|s| s.into_iter().collect()).collect(),
            order,
            params: self.params.clone(),
            sources,
            bindings: self.bindings.clone(),
        })
    }

    fn position(&self, name: &str) -> PipelineResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownStage {
                name: name.to_string(),
            })
    }

    /// Maps each output key to its single producer.
    fn check_output_conflicts(&self) -> PipelineResult<BTreeMap<&str, usize>> {
        let mut producers: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, spec) in self.stages.iter().enumerate() {
            for key in spec.outputs.keys() {
                if self.params.contains_key(key) {
                    return Err(PipelineError::OutputConflict {
                        key: key.clone(),
                        producers: vec![PARAMS_PRODUCER.to_string(), spec.name.clone()],
                    });
                }
                if let Some(&first) = producers.get(key.as_str()) {
                    return Err(PipelineError::OutputConflict {
                        key: key.clone(),
                        producers: vec![self.stages[first].name.clone(), spec.name.clone()],
                    });
                }
                producers.insert(key, idx);
            }
        }
        Ok(producers)
    }

    /// Finds where every declared input comes from.
    fn resolve_inputs(
        &self,
        producers: &BTreeMap<&str, usize>,
    ) -> PipelineResult<Vec<BTreeMap<String, InputSource>>> {
        // Later declarations for the same (consumer, key) win.
        let explicit: HashMap<(usize, &str), usize> = self
            .bindings
            .iter()
            .map(|b| ((b.consumer, b.key.as_str()), b.producer))
            .collect();

        let mut sources = Vec::with_capacity(self.stages.len());
        for (idx, spec) in self.stages.iter().enumerate() {
            let mut resolved = BTreeMap::new();
            for key in spec.inputs.keys() {
                let source = if let Some(&producer) = explicit.get(&(idx, key.as_str())) {
                    if !self.stages[producer].outputs.contains_key(key) {
                        return Err(PipelineError::UnresolvedInput {
                            stage: spec.name.clone(),
                            key: key.clone(),
                            reason: format!(
                                "bound producer '{}' does not declare output '{key}'",
                                self.stages[producer].name
                            ),
                        });
                    }
                    InputSource::Stage(producer)
                } else if let Some(&producer) = producers.get(key.as_str()) {
                    InputSource::Stage(producer)
                } else if self.params.contains_key(key) {
                    InputSource::Param
                } else {
                    return Err(PipelineError::UnresolvedInput {
                        stage: spec.name.clone(),
                        key: key.clone(),
                        reason: "no stage produces it and it is not a declared parameter".to_string(),
                    });
                };
                resolved.insert(key.clone(), source);
            }
            sources.push(resolved);
        }
        Ok(sources)
    }

    fn check_contracts(&self, sources: &[BTreeMap<String, InputSource>]) -> PipelineResult<()> {
        for (idx, resolved) in sources.iter().enumerate() {
            let consumer = &self.stages[idx];
            for (key, source) in resolved {
                let expected = consumer.inputs[key];
                let found = match source {
                    InputSource::Stage(producer) => self.stages[*producer].outputs[key],
                    InputSource::Param => self.params[key],
                };
                if !expected.accepts(found) {
                    return Err(PipelineError::ContractMismatch {
                        stage: consumer.name.clone(),
                        key: key.clone(),
                        expected,
                        found,
                    });
                }
            }
        }
        Ok(())
    }

    /// DFS with recursion-stack marking, roots visited in registration order.
    fn find_cycle(&self, downstream: &[BTreeSet<usize>]) -> Option<Vec<String>> {
        let n = self.stages.len();
        let mut visited = vec![false; n];
        let mut on_stack = vec![false; n];
        let mut path = Vec::new();

        for root in 0..n {
            if !visited[root] {
                if let Some(cycle) =
                    dfs_cycle(root, downstream, &mut visited, &mut on_stack, &mut path)
                {
                    return Some(
                        cycle
                            .into_iter()
                            .map(|idx| self.stages[idx].name.clone())
                            .collect(),
                    );
                }
            }
        }
        None
    }
}

fn dfs_cycle(
    node: usize,
    downstream: &[BTreeSet<usize>],
    visited: &mut [bool],
    on_stack: &mut [bool],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited[node] = true;
    on_stack[node] = true;
    path.push(node);

    for &next in &downstream[node] {
        if on_stack[next] {
            let start = path.iter().position(|&n| n == next).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(next);
            return Some(cycle);
        }
        if !visited[next] {
            if let Some(cycle) = dfs_cycle(next, downstream, visited, on_stack, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_stack[node] = false;
    None
}

/// Kahn's algorithm; among ready stages the lowest registration index goes first.
fn topological_order(upstream: &[BTreeSet<usize>], downstream: &[BTreeSet<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = upstream.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = remaining
        .iter()
        .enumerate()
        .filter(|(_, deps)| **deps == 0)
        .map(|(idx, _)| idx)
        .collect();
    let mut order = Vec::with_capacity(upstream.len());

    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &downstream[idx] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.insert(next);
            }
        }
    }
    order
}

fn validate_stage_name(name: &str) -> PipelineResult<()> {
    if name.is_empty() {
        return Err(PipelineError::InvalidStageName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }
    if !STAGE_NAME.is_match(name) {
        return Err(PipelineError::InvalidStageName {
            name: name.to_string(),
            reason: "only letters, digits, '_', '-' and '.' are allowed".to_string(),
        });
    }
    Ok(())
}
