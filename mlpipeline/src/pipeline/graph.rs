//! Immutable, validated pipeline graphs.

use super::StageSpec;
use crate::core::Contract;
use crate::errors::{PipelineError, PipelineResult};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// An explicit `producer -> consumer` binding for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) producer: usize,
    pub(crate) consumer: usize,
    pub(crate) key: String,
}

/// Where a stage input is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputSource {
    /// A declared initial parameter.
    Param,
    /// The output of the stage at this registration index.
    Stage(usize),
}

/// A validated, acyclic set of stages with a fixed execution order.
///
/// Produced by [`StageRegistry::build`](super::StageRegistry::build); it
/// cannot be modified afterwards and may be executed any number of times.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub(super) name: String,
    pub(super) stages: Vec<StageSpec>,
    pub(super) index: HashMap<String, usize>,
    pub(super) upstream: Vec<Vec<usize>>,
    pub(super) downstream: Vec<Vec<usize>>,
    pub(super) order: Vec<usize>,
    pub(super) params: Contract,
    pub(super) sources: Vec<BTreeMap<String, InputSource>>,
    pub(super) bindings: Vec<Binding>,
}

impl PipelineGraph {
    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; an empty definition never builds.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the stages in registration order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.index.get(name).map(|&idx| &self.stages[idx])
    }

    /// Returns the declared initial parameters.
    #[must_use]
    pub fn params(&self) -> &Contract {
        &self.params
    }

    /// Returns stage names in topological order.
    ///
    /// Stages whose dependencies are all satisfied come in registration order.
    #[must_use]
    pub fn execution_order(&self) -> Vec<&str> {
        self.order.iter().map(|&idx| self.stages[idx].name.as_str()).collect()
    }

    /// Returns the direct producers of a stage, in registration order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the stage does not exist.
    pub fn dependencies(&self, stage: &str) -> PipelineResult<Vec<&str>> {
        let idx = self.position(stage)?;
        Ok(self.names(&self.upstream[idx]))
    }

    /// Returns the direct consumers of a stage, in registration order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the stage does not exist.
    pub fn dependents(&self, stage: &str) -> PipelineResult<Vec<&str>> {
        let idx = self.position(stage)?;
        Ok(self.names(&self.downstream[idx]))
    }

    /// Returns true if `stage` transitively depends on `upstream`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if either stage does not exist.
    pub fn depends_on(&self, stage: &str, upstream: &str) -> PipelineResult<bool> {
        let start = self.position(stage)?;
        let target = self.position(upstream)?;

        let mut seen = vec![false; self.stages.len()];
        let mut stack = self.upstream[start].clone();
        while let Some(idx) = stack.pop() {
            if idx == target {
                return Ok(true);
            }
            if !seen[idx] {
                seen[idx] = true;
                stack.extend(&self.upstream[idx]);
            }
        }
        Ok(false)
    }

    /// Renders the execution plan as text.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Pipeline '{}' ({} stages)", self.name, self.stages.len());

        if !self.params.is_empty() {
            let _ = writeln!(out, "Parameters:");
            for (key, ty) in &self.params {
                let _ = writeln!(out, "  {key}: {ty}");
            }
        }

        let _ = writeln!(out, "Execution order:");
        for (pos, &idx) in self.order.iter().enumerate() {
            let spec = &self.stages[idx];
            let _ = write!(out, "  {}. {} [{}]", pos + 1, spec.name, spec.kind);
            if let Some(description) = &spec.description {
                let _ = write!(out, " - {description}");
            }
            out.push('\n');

            for (key, source) in &self.sources[idx] {
                let origin = match source {
                    InputSource::Param => "param".to_string(),
                    InputSource::Stage(p) => format!("from {}", self.stages[*p].name),
                };
                let _ = writeln!(out, "       in:  {key}: {} ({origin})", spec.inputs[key]);
            }
            for (key, ty) in &spec.outputs {
                let _ = writeln!(out, "       out: {key}: {ty}");
            }
            let ordering_only: Vec<&str> = self
                .bindings
                .iter()
                .filter(|b| b.consumer == idx && !spec.inputs.contains_key(&b.key))
                .map(|b| self.stages[b.producer].name.as_str())
                .collect();
            if !ordering_only.is_empty() {
                let _ = writeln!(out, "       after: {}", ordering_only.join(", "));
            }
        }
        out
    }

    /// Returns a SHA-256 hex digest of the graph's structure.
    ///
    /// Covers the pipeline name, stage names, contracts, parameters and
    /// edges, so it changes whenever the shape of the pipeline does.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("pipeline\0{}\n", self.name));
        for (key, ty) in &self.params {
            hasher.update(format!("param\0{key}\0{ty}\n"));
        }
        for (idx, spec) in self.stages.iter().enumerate() {
            hasher.update(format!("stage\0{}\0{}\n", spec.name, spec.kind));
            for (key, ty) in &spec.inputs {
                hasher.update(format!("in\0{key}\0{ty}\n"));
            }
            for (key, ty) in &spec.outputs {
                hasher.update(format!("out\0{key}\0{ty}\n"));
            }
            for &producer in &self.upstream[idx] {
                hasher.update(format!("edge\0{}\0{}\n", self.stages[producer].name, spec.name));
            }
        }
        hex::encode(hasher.finalize())
    }

    pub(crate) fn upstream_of(&self, idx: usize) -> &[usize] {
        &self.upstream[idx]
    }

    pub(crate) fn downstream_of(&self, idx: usize) -> &[usize] {
        &self.downstream[idx]
    }

    fn position(&self, name: &str) -> PipelineResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownStage {
                name: name.to_string(),
            })
    }

    fn names(&self, indices: &[usize]) -> Vec<&str> {
        indices.iter().map(|&idx| self.stages[idx].name.as_str()).collect()
    }
}
