//! Run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Status shared by pipeline runs and block runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Initial,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed and cancelled runs are never advanced again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// One execution instance of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_uuid: String,
    /// Absent for manually triggered runs
    pub pipeline_schedule_id: Option<Uuid>,
    /// Logical date of the schedule period this run covers
    pub execution_date: DateTime<Utc>,
    pub status: RunStatus,
    pub variables: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One execution instance of a single block within a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRun {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub block_uuid: String,
    pub status: RunStatus,
    /// Number of times this block run has been dispatched
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
