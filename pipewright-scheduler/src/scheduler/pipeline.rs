//! Per-run pipeline scheduler
//!
//! Advances a single pipeline run by one step:
//! - Reconciles block runs whose process has exited or overrun its timeout
//! - Puts failed block runs with attempts left back in the queue
//! - Finishes the run once every block completed, or once a failure can no
//!   longer be recovered
//! - Dispatches block runs whose upstream blocks have all completed, within
//!   the run's concurrency budget
//!
//! Pipelines in single-process mode are executed by one process for the
//! whole run instead, tracked as the run's pipeline-level process.

use chrono::{DateTime, Duration, Utc};
use pipewright_core::domain::pipeline::{BlockDefinition, ExecutionMode, Pipeline};
use pipewright_core::domain::run::{BlockRun, PipelineRun, RunStatus};
use pipewright_core::dto::run::{BlockRunUpdate, CreateBlockRun, PipelineRunUpdate};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use super::{SchedulerContext, reconcile};
use crate::error::{Result, SchedulerError};
use crate::process::{BlockExecution, PipelineExecution};

/// Scheduler bound to one pipeline run
pub struct PipelineScheduler {
    run: PipelineRun,
    ctx: SchedulerContext,
}

impl PipelineScheduler {
    pub fn new(run: PipelineRun, ctx: SchedulerContext) -> Self {
        Self { run, ctx }
    }

    /// The run as of the last store read or write
    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    /// Initializes the run: one INITIAL block run per block of the pipeline
    ///
    /// Blocks that already have a block run are skipped. Nothing is
    /// dispatched unless `should_schedule` is set, in which case one
    /// scheduling step follows.
    pub async fn start(&mut self, should_schedule: bool) -> Result<()> {
        let pipeline = self.load_pipeline().await?;
        self.initialize_block_runs(&pipeline).await?;

        if should_schedule {
            self.schedule().await?;
        }

        Ok(())
    }

    /// Creates the block runs missing from the run, returning how many
    async fn initialize_block_runs(&self, pipeline: &Pipeline) -> Result<usize> {
        let existing: HashSet<String> = self
            .ctx
            .store
            .block_runs(self.run.id)
            .await?
            .into_iter()
            .map(|b| b.block_uuid)
            .collect();

        let ordered = pipeline
            .topological_order()
            .map_err(|source| SchedulerError::InvalidPipeline {
                pipeline: pipeline.uuid.clone(),
                source,
            })?;

        let mut created = 0;
        for block in ordered {
            if existing.contains(&block.uuid) {
                continue;
            }
            self.ctx
                .store
                .create_block_run(CreateBlockRun {
                    pipeline_run_id: self.run.id,
                    block_uuid: block.uuid.clone(),
                })
                .await?;
            created += 1;
        }

        if created > 0 {
            info!(
                "Initialized {} block run(s) for pipeline run {} ({})",
                created, self.run.id, self.run.pipeline_uuid
            );
        }

        Ok(created)
    }

    /// Performs one scheduling step
    pub async fn schedule(&mut self) -> Result<()> {
        self.refresh().await?;

        if self.run.status.is_terminal() {
            debug!(
                "Pipeline run {} is {:?}, nothing to schedule",
                self.run.id, self.run.status
            );
            return Ok(());
        }

        let now = self.ctx.clock.now();
        let Some(pipeline) = self.ctx.store.find_pipeline(&self.run.pipeline_uuid).await? else {
            let reason = format!("pipeline '{}' no longer exists", self.run.pipeline_uuid);
            return self.fail_run(&reason, now).await;
        };

        // Runs created without start() get their block runs here
        if self.run.status == RunStatus::Initial {
            self.initialize_block_runs(&pipeline).await?;
        }

        match pipeline.execution_mode {
            ExecutionMode::PerBlock => self.schedule_blocks(&pipeline, now).await,
            ExecutionMode::SingleProcess => self.schedule_single_process(&pipeline, now).await,
        }
    }

    /// Cancels the run and terminates every process working on it
    pub async fn cancel(&mut self) -> Result<()> {
        self.refresh().await?;

        if self.run.status.is_terminal() {
            return Err(SchedulerError::InvalidState(format!(
                "Cannot cancel pipeline run {} in state {:?}",
                self.run.id, self.run.status
            )));
        }

        let now = self.ctx.clock.now();
        self.run = self
            .ctx
            .store
            .update_pipeline_run(
                self.run.id,
                PipelineRunUpdate::finished(RunStatus::Cancelled, now),
            )
            .await?;

        for block_run in self.ctx.store.block_runs(self.run.id).await? {
            if block_run.status.is_active() {
                self.ctx
                    .store
                    .update_block_run(block_run.id, BlockRunUpdate::cancelled(now))
                    .await?;
            }
        }

        self.ctx.registry.terminate_pipeline_process(self.run.id);
        let terminated = self.ctx.registry.terminate_block_processes(self.run.id);

        info!(
            "Pipeline run {} cancelled, {} block process(es) terminated",
            self.run.id, terminated
        );

        Ok(())
    }

    /// Re-runs a block and everything downstream of it
    ///
    /// In-flight processes of the affected block runs are terminated and the
    /// block runs go back to INITIAL. A finished run is reopened, and block
    /// runs cancelled when it finished are queued again along with them.
    pub async fn rerun_block(&mut self, block_uuid: &str) -> Result<()> {
        self.refresh().await?;
        let reopening = self.run.status.is_terminal();
        let pipeline = self.load_pipeline().await?;

        if pipeline.block(block_uuid).is_none() {
            return Err(SchedulerError::BlockNotFound {
                pipeline: pipeline.uuid.clone(),
                block: block_uuid.to_string(),
            });
        }

        let mut targets: HashSet<&str> = pipeline
            .downstream_blocks(block_uuid)
            .into_iter()
            .map(|b| b.uuid.as_str())
            .collect();
        targets.insert(block_uuid);

        let block_runs = self.ctx.store.block_runs(self.run.id).await?;
        for block_run in &block_runs {
            if !targets.contains(block_run.block_uuid.as_str()) {
                if reopening && block_run.status == RunStatus::Cancelled {
                    debug!(
                        "Requeueing cancelled block run {} ({})",
                        block_run.id, block_run.block_uuid
                    );
                    self.ctx
                        .store
                        .update_block_run(block_run.id, BlockRunUpdate::reset())
                        .await?;
                }
                continue;
            }

            if self.ctx.registry.terminate_block_process(block_run.id) {
                info!(
                    "Terminated in-flight block run {} ({}) invalidated by re-run of '{}'",
                    block_run.id, block_run.block_uuid, block_uuid
                );
            }

            self.ctx
                .store
                .update_block_run(block_run.id, BlockRunUpdate::reset())
                .await?;
        }

        // Blocks added to the pipeline after the run started
        for uuid in &targets {
            if !block_runs.iter().any(|b| b.block_uuid == *uuid) {
                self.ctx
                    .store
                    .create_block_run(CreateBlockRun {
                        pipeline_run_id: self.run.id,
                        block_uuid: uuid.to_string(),
                    })
                    .await?;
            }
        }

        match pipeline.execution_mode {
            ExecutionMode::SingleProcess => {
                self.ctx.registry.terminate_pipeline_process(self.run.id);
                self.run = self
                    .ctx
                    .store
                    .update_pipeline_run(self.run.id, PipelineRunUpdate::reopened(RunStatus::Initial))
                    .await?;
            }
            ExecutionMode::PerBlock if self.run.status.is_terminal() => {
                self.run = self
                    .ctx
                    .store
                    .update_pipeline_run(self.run.id, PipelineRunUpdate::reopened(RunStatus::Running))
                    .await?;
            }
            ExecutionMode::PerBlock => {}
        }

        info!(
            "Block '{}' of pipeline run {} reset with {} downstream block(s)",
            block_uuid,
            self.run.id,
            targets.len() - 1
        );

        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        self.run = self
            .ctx
            .store
            .find_pipeline_run(self.run.id)
            .await?
            .ok_or(SchedulerError::PipelineRunNotFound(self.run.id))?;
        Ok(())
    }

    async fn load_pipeline(&self) -> Result<Pipeline> {
        self.ctx
            .store
            .find_pipeline(&self.run.pipeline_uuid)
            .await?
            .ok_or_else(|| SchedulerError::PipelineNotFound(self.run.pipeline_uuid.clone()))
    }

    async fn schedule_blocks(&mut self, pipeline: &Pipeline, now: DateTime<Utc>) -> Result<()> {
        let mut block_runs = self.ctx.store.block_runs(self.run.id).await?;

        for block_run in block_runs.iter_mut() {
            if block_run.status == RunStatus::Running {
                if let Some(updated) = self.reconcile_block_run(pipeline, block_run, now).await? {
                    *block_run = updated;
                }
            }
        }

        for block_run in block_runs.iter_mut() {
            if block_run.status != RunStatus::Failed {
                continue;
            }
            let Some(block) = pipeline.block(&block_run.block_uuid) else {
                continue;
            };
            let retries = block.retries;
            if block_run.attempts <= retries {
                info!(
                    "Retrying block '{}' of pipeline run {} (attempt {}/{})",
                    block_run.block_uuid,
                    self.run.id,
                    block_run.attempts + 1,
                    retries + 1
                );
                *block_run = self
                    .ctx
                    .store
                    .update_block_run(block_run.id, BlockRunUpdate::retry())
                    .await?;
            }
        }

        if block_runs.iter().all(|b| b.status == RunStatus::Completed) {
            return self.finish(RunStatus::Completed, now).await;
        }

        let running = block_runs
            .iter()
            .filter(|b| b.status == RunStatus::Running)
            .count();

        if block_runs.iter().any(|b| b.status == RunStatus::Failed) {
            if running > 0 {
                debug!(
                    "Pipeline run {} has failed blocks, waiting for {} running block(s)",
                    self.run.id, running
                );
                return Ok(());
            }

            for block_run in block_runs.iter().filter(|b| b.status == RunStatus::Initial) {
                self.ctx
                    .store
                    .update_block_run(block_run.id, BlockRunUpdate::cancelled(now))
                    .await?;
            }
            return self.finish(RunStatus::Failed, now).await;
        }

        if !block_runs
            .iter()
            .any(|b| matches!(b.status, RunStatus::Initial | RunStatus::Running))
        {
            warn!(
                "Pipeline run {} has unfinished block runs but none left to execute",
                self.run.id
            );
            return self.finish(RunStatus::Cancelled, now).await;
        }

        let limit = pipeline
            .concurrency
            .unwrap_or(self.ctx.max_concurrent_blocks)
            .max(1);
        let mut budget = limit.saturating_sub(running);

        let completed: HashSet<String> = block_runs
            .iter()
            .filter(|b| b.status == RunStatus::Completed)
            .map(|b| b.block_uuid.clone())
            .collect();

        let mut dispatched = 0;
        for block_run in block_runs.iter().filter(|b| b.status == RunStatus::Initial) {
            if budget == 0 {
                debug!(
                    "Pipeline run {} reached its concurrency limit of {}",
                    self.run.id, limit
                );
                break;
            }

            let Some(block) = pipeline.block(&block_run.block_uuid) else {
                let reason = format!("block '{}' no longer exists", block_run.block_uuid);
                self.ctx
                    .store
                    .update_block_run(block_run.id, BlockRunUpdate::failed(reason, now))
                    .await?;
                continue;
            };

            if !block.upstream_blocks.iter().all(|u| completed.contains(u)) {
                continue;
            }

            let live = self
                .ctx
                .registry
                .block_process(self.run.id, block_run.id)
                .is_some_and(|handle| handle.is_alive());
            if live {
                debug!(
                    "Block run {} still has a live process, not dispatching",
                    block_run.id
                );
                continue;
            }

            if self.dispatch_block(block, block_run, now).await? {
                dispatched += 1;
                budget -= 1;
            }
        }

        if dispatched > 0 && self.run.status == RunStatus::Initial {
            self.run = self
                .ctx
                .store
                .update_pipeline_run(self.run.id, PipelineRunUpdate::started(now))
                .await?;
            info!("Pipeline run {} started", self.run.id);
        }

        Ok(())
    }

    /// Brings a RUNNING block run in line with its process
    async fn reconcile_block_run(
        &self,
        pipeline: &Pipeline,
        block_run: &BlockRun,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockRun>> {
        let update = match self.ctx.registry.block_process(self.run.id, block_run.id) {
            Some(handle) if handle.is_alive() => {
                let timeout = pipeline
                    .block(&block_run.block_uuid)
                    .and_then(|b| b.timeout_seconds);
                let (Some(seconds), Some(started_at)) = (timeout, block_run.started_at) else {
                    return Ok(None);
                };
                // Timeouts too large to represent never expire
                let Some(limit) = i64::try_from(seconds).ok().and_then(Duration::try_seconds)
                else {
                    return Ok(None);
                };
                if now - started_at < limit {
                    return Ok(None);
                }

                warn!(
                    "Block '{}' of pipeline run {} exceeded its {}s timeout",
                    block_run.block_uuid, self.run.id, seconds
                );
                if let Err(e) = handle.terminate() {
                    warn!("Failed to terminate block run {}: {}", block_run.id, e);
                }
                BlockRunUpdate::failed(format!("timed out after {}s", seconds), now)
            }
            Some(handle) => BlockRunUpdate::exited(handle.exit_code(), now),
            None => {
                warn!(
                    "Block run {} ({}) is running without a process",
                    block_run.id, block_run.block_uuid
                );
                BlockRunUpdate::failed("process lost", now)
            }
        };

        let updated = self
            .ctx
            .store
            .update_block_run(block_run.id, update)
            .await?;

        info!(
            "Block '{}' of pipeline run {} finished with status {:?}",
            updated.block_uuid, self.run.id, updated.status
        );

        Ok(Some(updated))
    }

    /// Spawns and registers the process of one block run
    ///
    /// A spawn failure fails the block run instead of the scheduling step.
    async fn dispatch_block(
        &self,
        block: &BlockDefinition,
        block_run: &BlockRun,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let execution = BlockExecution {
            pipeline_uuid: self.run.pipeline_uuid.clone(),
            pipeline_run_id: self.run.id,
            block_run_id: block_run.id,
            block_uuid: block.uuid.clone(),
            command: block.command.clone(),
            execution_date: self.run.execution_date,
            variables: self.run.variables.clone(),
        };
        let attempts = block_run.attempts + 1;

        match self.ctx.spawner.spawn_block(&execution) {
            Ok(handle) => {
                self.ctx
                    .registry
                    .set_block_process(self.run.id, block_run.id, handle);
                self.ctx
                    .store
                    .update_block_run(block_run.id, BlockRunUpdate::dispatched(attempts, now))
                    .await?;
                info!(
                    "Dispatched block '{}' of pipeline run {} (attempt {})",
                    block.uuid, self.run.id, attempts
                );
                Ok(true)
            }
            Err(e) => {
                error!(
                    "Failed to dispatch block '{}' of pipeline run {}: {}",
                    block.uuid, self.run.id, e
                );
                let update = BlockRunUpdate {
                    attempts: Some(attempts),
                    ..BlockRunUpdate::failed(e.to_string(), now)
                };
                self.ctx.store.update_block_run(block_run.id, update).await?;
                Ok(false)
            }
        }
    }

    async fn schedule_single_process(
        &mut self,
        pipeline: &Pipeline,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.ctx.registry.pipeline_process(self.run.id) {
            Some(handle) if handle.is_alive() => {
                debug!("Pipeline run {} process still running", self.run.id);
                Ok(())
            }
            Some(handle) if self.run.status == RunStatus::Running => {
                reconcile::record_pipeline_exit(
                    self.ctx.store.as_ref(),
                    self.run.id,
                    handle.exit_code(),
                    now,
                )
                .await?;
                self.refresh().await
            }
            None if self.run.status == RunStatus::Running => {
                warn!("Pipeline run {} is running without a process", self.run.id);
                self.fail_run("process lost", now).await
            }
            _ => self.spawn_pipeline_process(pipeline, now).await,
        }
    }

    /// Starts one process executing every unfinished block of the run
    async fn spawn_pipeline_process(&mut self, pipeline: &Pipeline, now: DateTime<Utc>) -> Result<()> {
        let block_runs = self.ctx.store.block_runs(self.run.id).await?;
        let pending: HashSet<&str> = block_runs
            .iter()
            .filter(|b| b.status != RunStatus::Completed)
            .map(|b| b.block_uuid.as_str())
            .collect();

        let blocks = pipeline
            .topological_order()
            .map_err(|source| SchedulerError::InvalidPipeline {
                pipeline: pipeline.uuid.clone(),
                source,
            })?
            .into_iter()
            .filter(|b| pending.contains(b.uuid.as_str()))
            .map(|b| (b.uuid.clone(), b.command.clone()))
            .collect();

        let execution = PipelineExecution {
            pipeline_uuid: self.run.pipeline_uuid.clone(),
            pipeline_run_id: self.run.id,
            execution_date: self.run.execution_date,
            variables: self.run.variables.clone(),
            blocks,
        };

        let handle = match self.ctx.spawner.spawn_pipeline(&execution) {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    "Failed to spawn process for pipeline run {}: {}",
                    self.run.id, e
                );
                return self.fail_run(&e.to_string(), now).await;
            }
        };

        self.ctx.registry.set_pipeline_process(self.run.id, handle);

        for block_run in block_runs.iter().filter(|b| b.status.is_active()) {
            self.ctx
                .store
                .update_block_run(
                    block_run.id,
                    BlockRunUpdate::dispatched(block_run.attempts + 1, now),
                )
                .await?;
        }

        self.run = self
            .ctx
            .store
            .update_pipeline_run(self.run.id, PipelineRunUpdate::started(now))
            .await?;

        info!(
            "Pipeline run {} started in a single process ({} block(s))",
            self.run.id,
            execution.blocks.len()
        );

        Ok(())
    }

    async fn finish(&mut self, status: RunStatus, now: DateTime<Utc>) -> Result<()> {
        self.run = self
            .ctx
            .store
            .update_pipeline_run(self.run.id, PipelineRunUpdate::finished(status, now))
            .await?;
        info!(
            "Pipeline run {} ({}) finished with status {:?}",
            self.run.id, self.run.pipeline_uuid, status
        );
        Ok(())
    }

    /// Fails the run together with every unfinished block run
    async fn fail_run(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        for block_run in self.ctx.store.block_runs(self.run.id).await? {
            if block_run.status.is_active() {
                self.ctx
                    .store
                    .update_block_run(block_run.id, BlockRunUpdate::failed(reason, now))
                    .await?;
            }
        }

        error!("Pipeline run {} failed: {}", self.run.id, reason);
        self.finish(RunStatus::Failed, now).await
    }
}
