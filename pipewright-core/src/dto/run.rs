//! Run DTOs for run store communication

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::run::{BlockRun, PipelineRun, RunStatus};

/// Request to create a new pipeline run
#[derive(Debug, Clone)]
pub struct CreatePipelineRun {
    pub pipeline_uuid: String,
    pub pipeline_schedule_id: Option<Uuid>,
    pub execution_date: DateTime<Utc>,
    pub variables: HashMap<String, serde_json::Value>,
}

/// Request to create a new block run
#[derive(Debug, Clone)]
pub struct CreateBlockRun {
    pub pipeline_run_id: Uuid,
    pub block_uuid: String,
}

/// Partial update of a pipeline run
///
/// `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineRunUpdate {
    pub status: Option<RunStatus>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl PipelineRunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Running),
            started_at: Some(Some(now)),
            ..Default::default()
        }
    }

    pub fn finished(status: RunStatus, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(Some(now)),
            ..Default::default()
        }
    }

    /// Moves a finished run back to `status` after some of its blocks are reset
    pub fn reopened(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(None),
            ..Default::default()
        }
    }

    pub fn apply(&self, run: &mut PipelineRun) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(started_at) = self.started_at {
            run.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            run.completed_at = completed_at;
        }
    }
}

/// Partial update of a block run
///
/// `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockRunUpdate {
    pub status: Option<RunStatus>,
    pub attempts: Option<u32>,
    pub exit_code: Option<Option<i32>>,
    pub error: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl BlockRunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Block run handed to a freshly spawned process
    pub fn dispatched(attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Running),
            attempts: Some(attempts),
            exit_code: Some(None),
            error: Some(None),
            started_at: Some(Some(now)),
            completed_at: Some(None),
        }
    }

    /// Block run whose process exited
    ///
    /// Exit code 0 completes the run; anything else, including an unknown
    /// exit code (killed by a signal), fails it.
    pub fn exited(exit_code: Option<i32>, now: DateTime<Utc>) -> Self {
        match exit_code {
            Some(0) => Self {
                status: Some(RunStatus::Completed),
                exit_code: Some(Some(0)),
                completed_at: Some(Some(now)),
                ..Default::default()
            },
            Some(code) => Self::failed(format!("process exited with code {}", code), now)
                .with_exit_code(Some(code)),
            None => Self::failed("process terminated without an exit code", now),
        }
    }

    pub fn failed(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error: Some(Some(error.into())),
            completed_at: Some(Some(now)),
            ..Default::default()
        }
    }

    pub fn cancelled(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Cancelled),
            completed_at: Some(Some(now)),
            ..Default::default()
        }
    }

    /// Back to INITIAL for another attempt, keeping the attempt count
    pub fn retry() -> Self {
        Self {
            status: Some(RunStatus::Initial),
            exit_code: Some(None),
            error: Some(None),
            started_at: Some(None),
            completed_at: Some(None),
            ..Default::default()
        }
    }

    /// Back to INITIAL as if never dispatched
    pub fn reset() -> Self {
        Self {
            attempts: Some(0),
            ..Self::retry()
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn apply(&self, run: &mut BlockRun) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(attempts) = self.attempts {
            run.attempts = attempts;
        }
        if let Some(exit_code) = self.exit_code {
            run.exit_code = exit_code;
        }
        if let Some(error) = &self.error {
            run.error = error.clone();
        }
        if let Some(started_at) = self.started_at {
            run.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            run.completed_at = completed_at;
        }
    }
}
