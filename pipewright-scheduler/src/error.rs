//! Error types for the scheduler

use pipewright_core::domain::pipeline::PipelineError;
use pipewright_core::domain::schedule::ScheduleError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur while scheduling and supervising runs
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Pipeline definition missing from the run store
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Pipeline run not found: {0}")]
    PipelineRunNotFound(Uuid),

    #[error("Block run not found: {0}")]
    BlockRunNotFound(Uuid),

    #[error("Block '{block}' not found in pipeline '{pipeline}'")]
    BlockNotFound { pipeline: String, block: String },

    #[error("Invalid pipeline '{pipeline}': {source}")]
    InvalidPipeline {
        pipeline: String,
        #[source]
        source: PipelineError,
    },

    #[error("Invalid schedule '{schedule}': {source}")]
    InvalidSchedule {
        schedule: String,
        #[source]
        source: ScheduleError,
    },

    /// Execution unit could not be started
    #[error("Failed to spawn process for {target}: {source}")]
    Spawn {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Termination signal could not be delivered
    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    /// Operation not allowed in the current run state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to read project file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse project file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound(_)
                | Self::PipelineRunNotFound(_)
                | Self::BlockRunNotFound(_)
                | Self::BlockNotFound { .. }
        )
    }
}
