//! In-memory run store
//!
//! Keeps every record in process memory. Records are lost on restart, which
//! is fine for a single scheduler instance driving short-lived runs and for
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipewright_core::domain::pipeline::Pipeline;
use pipewright_core::domain::run::{BlockRun, PipelineRun, RunStatus};
use pipewright_core::domain::schedule::PipelineSchedule;
use pipewright_core::dto::run::{
    BlockRunUpdate, CreateBlockRun, CreatePipelineRun, PipelineRunUpdate,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{ProjectDefinition, RunStore};
use crate::error::{Result, SchedulerError};

#[derive(Default)]
struct StoreState {
    pipelines: HashMap<String, Pipeline>,
    schedules: Vec<PipelineSchedule>,
    pipeline_runs: Vec<PipelineRun>,
    block_runs: Vec<BlockRun>,
}

/// Run store backed by process memory
#[derive(Default)]
pub struct InMemoryRunStore {
    state: Mutex<StoreState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with the pipelines and schedules of a project
    pub fn from_project(project: ProjectDefinition) -> Result<Self> {
        project.validate()?;

        let store = Self::new();
        for pipeline in project.pipelines {
            store.add_pipeline(pipeline)?;
        }
        for schedule in project.schedules {
            store.add_schedule(schedule)?;
        }
        Ok(store)
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds or replaces a pipeline definition
    pub fn add_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        pipeline
            .validate()
            .map_err(|source| SchedulerError::InvalidPipeline {
                pipeline: pipeline.uuid.clone(),
                source,
            })?;

        debug!("Storing pipeline '{}'", pipeline.uuid);
        self.state()
            .pipelines
            .insert(pipeline.uuid.clone(), pipeline);
        Ok(())
    }

    /// Adds a schedule after checking its interval parses
    pub fn add_schedule(&self, schedule: PipelineSchedule) -> Result<()> {
        schedule
            .interval()
            .map_err(|source| SchedulerError::InvalidSchedule {
                schedule: schedule.name.clone(),
                source,
            })?;

        debug!("Storing schedule '{}' ({})", schedule.name, schedule.id);
        let mut state = self.state();
        state.schedules.retain(|s| s.id != schedule.id);
        state.schedules.push(schedule);
        Ok(())
    }

    pub fn schedules(&self) -> Vec<PipelineSchedule> {
        self.state().schedules.clone()
    }

    /// Every pipeline run, whatever its status, in creation order
    pub fn pipeline_runs(&self) -> Vec<PipelineRun> {
        self.state().pipeline_runs.clone()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn find_pipeline(&self, uuid: &str) -> Result<Option<Pipeline>> {
        Ok(self.state().pipelines.get(uuid).cloned())
    }

    async fn active_schedules(&self) -> Result<Vec<PipelineSchedule>> {
        Ok(self
            .state()
            .schedules
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect())
    }

    async fn mark_schedule_enqueued(&self, schedule_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(schedule) = self
            .state()
            .schedules
            .iter_mut()
            .find(|s| s.id == schedule_id)
        {
            schedule.last_enqueued_at = Some(at);
        }
        Ok(())
    }

    async fn create_pipeline_run(&self, req: CreatePipelineRun) -> Result<PipelineRun> {
        let run = PipelineRun {
            id: Uuid::new_v4(),
            pipeline_uuid: req.pipeline_uuid,
            pipeline_schedule_id: req.pipeline_schedule_id,
            execution_date: req.execution_date,
            status: RunStatus::Initial,
            variables: req.variables,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        self.state().pipeline_runs.push(run.clone());
        Ok(run)
    }

    async fn find_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>> {
        Ok(self
            .state()
            .pipeline_runs
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn active_pipeline_runs(&self) -> Result<Vec<PipelineRun>> {
        Ok(self
            .state()
            .pipeline_runs
            .iter()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect())
    }

    async fn pipeline_runs_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<PipelineRun>> {
        Ok(self
            .state()
            .pipeline_runs
            .iter()
            .filter(|r| r.pipeline_schedule_id == Some(schedule_id))
            .cloned()
            .collect())
    }

    async fn update_pipeline_run(
        &self,
        id: Uuid,
        update: PipelineRunUpdate,
    ) -> Result<PipelineRun> {
        let mut state = self.state();
        let run = state
            .pipeline_runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(SchedulerError::PipelineRunNotFound(id))?;

        update.apply(run);
        Ok(run.clone())
    }

    async fn create_block_run(&self, req: CreateBlockRun) -> Result<BlockRun> {
        let block_run = BlockRun {
            id: Uuid::new_v4(),
            pipeline_run_id: req.pipeline_run_id,
            block_uuid: req.block_uuid,
            status: RunStatus::Initial,
            attempts: 0,
            exit_code: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        self.state().block_runs.push(block_run.clone());
        Ok(block_run)
    }

    async fn find_block_run(&self, id: Uuid) -> Result<Option<BlockRun>> {
        Ok(self.state().block_runs.iter().find(|b| b.id == id).cloned())
    }

    async fn block_runs(&self, pipeline_run_id: Uuid) -> Result<Vec<BlockRun>> {
        Ok(self
            .state()
            .block_runs
            .iter()
            .filter(|b| b.pipeline_run_id == pipeline_run_id)
            .cloned()
            .collect())
    }

    async fn update_block_run(&self, id: Uuid, update: BlockRunUpdate) -> Result<BlockRun> {
        let mut state = self.state();
        let block_run = state
            .block_runs
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or(SchedulerError::BlockRunNotFound(id))?;

        update.apply(block_run);
        Ok(block_run.clone())
    }
}
