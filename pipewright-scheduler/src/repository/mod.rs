//! Repository layer
//!
//! The run store owns persisted pipelines, schedules, pipeline runs and
//! block runs. The scheduler reads and writes through the [`RunStore`]
//! trait only, so a database-backed store can replace the in-memory one
//! without touching scheduling logic.

mod memory;
mod project;

// Re-export implementations
pub use memory::InMemoryRunStore;
pub use project::ProjectDefinition;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipewright_core::domain::pipeline::Pipeline;
use pipewright_core::domain::run::{BlockRun, PipelineRun};
use pipewright_core::domain::schedule::PipelineSchedule;
use pipewright_core::dto::run::{
    BlockRunUpdate, CreateBlockRun, CreatePipelineRun, PipelineRunUpdate,
};
use uuid::Uuid;

use crate::error::Result;

/// Repository trait for run state
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetches a pipeline definition by uuid
    async fn find_pipeline(&self, uuid: &str) -> Result<Option<Pipeline>>;

    /// Fetches every schedule whose status is active
    async fn active_schedules(&self) -> Result<Vec<PipelineSchedule>>;

    /// Records that a run was just created from the schedule
    async fn mark_schedule_enqueued(&self, schedule_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Creates a pipeline run in INITIAL status
    async fn create_pipeline_run(&self, req: CreatePipelineRun) -> Result<PipelineRun>;

    async fn find_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>>;

    /// Fetches every pipeline run in INITIAL or RUNNING status, oldest first
    async fn active_pipeline_runs(&self) -> Result<Vec<PipelineRun>>;

    /// Fetches every run created from a schedule, whatever its status
    async fn pipeline_runs_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<PipelineRun>>;

    /// Applies a partial update and returns the updated run
    async fn update_pipeline_run(&self, id: Uuid, update: PipelineRunUpdate)
    -> Result<PipelineRun>;

    /// Creates a block run in INITIAL status
    async fn create_block_run(&self, req: CreateBlockRun) -> Result<BlockRun>;

    async fn find_block_run(&self, id: Uuid) -> Result<Option<BlockRun>>;

    /// Fetches the block runs of a pipeline run in creation order
    async fn block_runs(&self, pipeline_run_id: Uuid) -> Result<Vec<BlockRun>>;

    /// Applies a partial update and returns the updated block run
    async fn update_block_run(&self, id: Uuid, update: BlockRunUpdate) -> Result<BlockRun>;
}
