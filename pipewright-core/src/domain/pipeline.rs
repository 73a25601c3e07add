//! Pipeline domain types
//!
//! A pipeline is a DAG of blocks. Each block is one shell command that runs
//! once all of its upstream blocks have completed.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Pipeline definition
///
/// Structure shared between the run store (persists) and the scheduler (dispatches).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub blocks: Vec<BlockDefinition>,
    /// Maximum number of block runs executing at once within one pipeline run
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Default variables handed to every run of this pipeline
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

/// How the blocks of a pipeline run are turned into OS processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One process per block run, dispatched as dependencies complete
    #[default]
    PerBlock,
    /// One process executes every block of the run in dependency order
    SingleProcess,
}

/// A single node of the pipeline DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub uuid: String,
    /// Shell command line executed for this block
    pub command: String,
    #[serde(default)]
    pub upstream_blocks: Vec<String>,
    /// Extra attempts after a failed one
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Structural problems in a pipeline definition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline uuid cannot be empty")]
    EmptyUuid,

    #[error("block uuid cannot be empty in pipeline '{0}'")]
    EmptyBlockUuid(String),

    #[error("duplicate block '{0}'")]
    DuplicateBlock(String),

    #[error("block '{block}' depends on unknown block '{upstream}'")]
    UnknownUpstream { block: String, upstream: String },

    #[error("dependency cycle involving block(s): {0}")]
    Cycle(String),
}

impl Pipeline {
    /// Looks up a block by uuid
    pub fn block(&self, uuid: &str) -> Option<&BlockDefinition> {
        self.blocks.iter().find(|b| b.uuid == uuid)
    }

    /// Checks uuids, upstream references and acyclicity
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.uuid.is_empty() {
            return Err(PipelineError::EmptyUuid);
        }

        let mut seen = HashSet::new();
        for block in &self.blocks {
            if block.uuid.is_empty() {
                return Err(PipelineError::EmptyBlockUuid(self.uuid.clone()));
            }
            if !seen.insert(block.uuid.as_str()) {
                return Err(PipelineError::DuplicateBlock(block.uuid.clone()));
            }
        }

        for block in &self.blocks {
            for upstream in &block.upstream_blocks {
                if !seen.contains(upstream.as_str()) {
                    return Err(PipelineError::UnknownUpstream {
                        block: block.uuid.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Returns the blocks ordered so that every block follows its upstream blocks
    ///
    /// Ties keep declaration order.
    pub fn topological_order(&self) -> Result<Vec<&BlockDefinition>, PipelineError> {
        let mut in_degree: HashMap<&str, usize> = self
            .blocks
            .iter()
            .map(|b| {
                let upstream: HashSet<&str> = b.upstream_blocks.iter().map(String::as_str).collect();
                (b.uuid.as_str(), upstream.len())
            })
            .collect();

        let mut queue: VecDeque<&BlockDefinition> = self
            .blocks
            .iter()
            .filter(|b| b.upstream_blocks.is_empty())
            .collect();

        let mut ordered = Vec::with_capacity(self.blocks.len());

        while let Some(block) = queue.pop_front() {
            ordered.push(block);
            for downstream in self.direct_downstream(&block.uuid) {
                if let Some(degree) = in_degree.get_mut(downstream.uuid.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(downstream);
                    }
                }
            }
        }

        if ordered.len() != self.blocks.len() {
            let placed: HashSet<&str> = ordered.iter().map(|b| b.uuid.as_str()).collect();
            let stuck: Vec<&str> = self
                .blocks
                .iter()
                .map(|b| b.uuid.as_str())
                .filter(|uuid| !placed.contains(uuid))
                .collect();
            return Err(PipelineError::Cycle(stuck.join(", ")));
        }

        Ok(ordered)
    }

    /// Returns every block reachable downstream of `uuid`, excluding itself
    pub fn downstream_blocks(&self, uuid: &str) -> Vec<&BlockDefinition> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut result = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([uuid]);

        while let Some(current) = queue.pop_front() {
            for downstream in self.direct_downstream(current) {
                if visited.insert(downstream.uuid.as_str()) {
                    result.push(downstream);
                    queue.push_back(downstream.uuid.as_str());
                }
            }
        }

        result
    }

    fn direct_downstream<'a>(&'a self, uuid: &str) -> impl Iterator<Item = &'a BlockDefinition> {
        self.blocks
            .iter()
            .filter(move |b| b.upstream_blocks.iter().any(|u| u == uuid))
    }
}
