//! Process layer
//!
//! Execution units are OS processes started for a single block run or for a
//! whole pipeline run. The scheduler only sees them through the
//! [`ProcessHandle`] trait, so the registry and the schedulers can be
//! exercised without real processes.

mod command;
mod registry;

pub use command::{CommandHandle, CommandSpawner};
pub use registry::{BlockProcessKey, ProcessRegistry};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Handle to a live (or recently exited) execution unit
pub trait ProcessHandle: Send + Sync {
    /// True until the process has exited
    fn is_alive(&self) -> bool;

    /// Sends a termination signal to the process
    fn terminate(&self) -> Result<()>;

    /// Terminates the process together with every process it spawned
    fn terminate_children(&self) -> Result<()> {
        self.terminate()
    }

    /// Exit code once the process has exited; `None` while running or when
    /// it was killed by a signal
    fn exit_code(&self) -> Option<i32>;
}

/// Shared handle as stored in the registry
pub type SharedHandle = Arc<dyn ProcessHandle>;

/// Everything needed to start the execution unit for one block run
#[derive(Debug, Clone)]
pub struct BlockExecution {
    pub pipeline_uuid: String,
    pub pipeline_run_id: Uuid,
    pub block_run_id: Uuid,
    pub block_uuid: String,
    pub command: String,
    pub execution_date: DateTime<Utc>,
    pub variables: HashMap<String, serde_json::Value>,
}

/// Everything needed to start one execution unit for a whole pipeline run
#[derive(Debug, Clone)]
pub struct PipelineExecution {
    pub pipeline_uuid: String,
    pub pipeline_run_id: Uuid,
    pub execution_date: DateTime<Utc>,
    pub variables: HashMap<String, serde_json::Value>,
    /// `(block uuid, command)` pairs in dependency order
    pub blocks: Vec<(String, String)>,
}

/// Capability to start execution units
pub trait ProcessSpawner: Send + Sync {
    fn spawn_block(&self, execution: &BlockExecution) -> Result<SharedHandle>;

    fn spawn_pipeline(&self, execution: &PipelineExecution) -> Result<SharedHandle>;
}
