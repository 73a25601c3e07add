//! Scheduling tick
//!
//! Invoked on a fixed interval. Each tick creates runs for due schedules,
//! advances every active run by one step and sweeps the process registry.
//! A failure on one schedule or run is logged and counted; the rest of the
//! tick goes on.

use chrono::{DateTime, Utc};
use pipewright_core::domain::run::PipelineRun;
use pipewright_core::domain::schedule::{PipelineSchedule, ScheduleError};
use pipewright_core::dto::run::CreatePipelineRun;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{PipelineScheduler, SchedulerContext};
use crate::error::{Result, SchedulerError};
use crate::process::ProcessRegistry;

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pipeline runs created for due schedules
    pub runs_created: usize,
    /// Active pipeline runs advanced by one step
    pub runs_advanced: usize,
    /// Schedules or runs that could not be processed
    pub failures: usize,
}

/// Entry point driving every schedule and run
pub struct Scheduler {
    ctx: SchedulerContext,
    reap_child_processes: bool,
    /// Serializes overlapping ticks and the manual operations
    tick_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext, reap_child_processes: bool) -> Self {
        Self {
            ctx,
            reap_child_processes,
            tick_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.ctx.registry
    }

    /// Runs the tick every `interval` until `shutdown` resolves
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        info!("Starting scheduler (tick interval: {:?})", interval);

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.schedule().await;
                    if report.runs_created > 0 || report.failures > 0 {
                        info!(
                            "Tick created {} run(s), advanced {} run(s), {} failure(s)",
                            report.runs_created, report.runs_advanced, report.failures
                        );
                    }
                }
            }
        }
    }

    /// Performs one scheduling tick
    pub async fn schedule(&self) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        let now = self.ctx.clock.now();
        let mut report = TickReport::default();

        debug!("Scheduling tick at {}", now);

        match self.ctx.store.active_schedules().await {
            Ok(schedules) => {
                for schedule in schedules {
                    match self.enqueue_if_due(&schedule, now).await {
                        Ok(true) => report.runs_created += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!("Failed to evaluate schedule '{}': {}", schedule.name, e);
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to fetch active schedules: {}", e);
                report.failures += 1;
            }
        }

        match self.ctx.store.active_pipeline_runs().await {
            Ok(runs) => {
                for run in runs {
                    let run_id = run.id;
                    let mut scheduler = PipelineScheduler::new(run, self.ctx.clone());
                    match scheduler.schedule().await {
                        Ok(()) => report.runs_advanced += 1,
                        Err(e) => {
                            warn!("Failed to advance pipeline run {}: {}", run_id, e);
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to fetch active pipeline runs: {}", e);
                report.failures += 1;
            }
        }

        self.ctx
            .registry
            .clean_up_processes(self.reap_child_processes)
            .await;

        report
    }

    /// Creates a run for the schedule when its current period has none yet
    async fn enqueue_if_due(&self, schedule: &PipelineSchedule, now: DateTime<Utc>) -> Result<bool> {
        let invalid = |source: ScheduleError| SchedulerError::InvalidSchedule {
            schedule: schedule.name.clone(),
            source,
        };

        let pipeline = self
            .ctx
            .store
            .find_pipeline(&schedule.pipeline_uuid)
            .await?
            .ok_or_else(|| SchedulerError::PipelineNotFound(schedule.pipeline_uuid.clone()))?;

        let existing = self.ctx.store.pipeline_runs_for_schedule(schedule.id).await?;
        if !schedule.should_schedule(now, &existing).map_err(invalid)? {
            return Ok(false);
        }

        let execution_date = schedule
            .interval()
            .and_then(|interval| interval.execution_date(now))
            .map_err(invalid)?;

        let mut variables = pipeline.variables.clone();
        variables.extend(schedule.variables.clone());

        let run = self
            .ctx
            .store
            .create_pipeline_run(CreatePipelineRun {
                pipeline_uuid: pipeline.uuid.clone(),
                pipeline_schedule_id: Some(schedule.id),
                execution_date,
                variables,
            })
            .await?;
        self.ctx.store.mark_schedule_enqueued(schedule.id, now).await?;

        info!(
            "Schedule '{}' created pipeline run {} for {}",
            schedule.name, run.id, execution_date
        );

        PipelineScheduler::new(run, self.ctx.clone()).start(false).await?;
        Ok(true)
    }

    /// Creates a manual run of a pipeline
    ///
    /// `variables` are merged over the pipeline's. The run is dispatched by
    /// the next tick.
    pub async fn trigger_pipeline(
        &self,
        pipeline_uuid: &str,
        variables: HashMap<String, Value>,
    ) -> Result<PipelineRun> {
        let _guard = self.tick_lock.lock().await;

        let pipeline = self
            .ctx
            .store
            .find_pipeline(pipeline_uuid)
            .await?
            .ok_or_else(|| SchedulerError::PipelineNotFound(pipeline_uuid.to_string()))?;

        let mut merged = pipeline.variables.clone();
        merged.extend(variables);

        let run = self
            .ctx
            .store
            .create_pipeline_run(CreatePipelineRun {
                pipeline_uuid: pipeline.uuid.clone(),
                pipeline_schedule_id: None,
                execution_date: self.ctx.clock.now(),
                variables: merged,
            })
            .await?;

        info!("Triggered pipeline run {} ({})", run.id, pipeline.uuid);

        let mut scheduler = PipelineScheduler::new(run, self.ctx.clone());
        scheduler.start(false).await?;
        Ok(scheduler.run().clone())
    }

    pub async fn cancel_pipeline_run(&self, pipeline_run_id: Uuid) -> Result<PipelineRun> {
        let _guard = self.tick_lock.lock().await;
        let mut scheduler = self.pipeline_scheduler(pipeline_run_id).await?;
        scheduler.cancel().await?;
        Ok(scheduler.run().clone())
    }

    pub async fn rerun_block(&self, pipeline_run_id: Uuid, block_uuid: &str) -> Result<PipelineRun> {
        let _guard = self.tick_lock.lock().await;
        let mut scheduler = self.pipeline_scheduler(pipeline_run_id).await?;
        scheduler.rerun_block(block_uuid).await?;
        Ok(scheduler.run().clone())
    }

    async fn pipeline_scheduler(&self, pipeline_run_id: Uuid) -> Result<PipelineScheduler> {
        let run = self
            .ctx
            .store
            .find_pipeline_run(pipeline_run_id)
            .await?
            .ok_or(SchedulerError::PipelineRunNotFound(pipeline_run_id))?;
        Ok(PipelineScheduler::new(run, self.ctx.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::repository::RunStore;
    use crate::testing::{FakeHandle, block, harness, pipeline, schedule};
    use chrono::TimeZone;
    use pipewright_core::domain::run::RunStatus;
    use pipewright_core::dto::run::PipelineRunUpdate;
    use serde_json::json;

    #[tokio::test]
    async fn test_due_schedule_creates_one_run_per_period() {
        let h = harness(4);
        h.store
            .add_pipeline(pipeline("etl", vec![block("a", &[])]))
            .unwrap();
        let hourly = schedule("etl", "@hourly");
        h.store.add_schedule(hourly.clone()).unwrap();
        let scheduler = Scheduler::new(h.context.clone(), false);

        let report = scheduler.schedule().await;
        assert_eq!(
            report,
            TickReport {
                runs_created: 1,
                runs_advanced: 1,
                failures: 0
            }
        );

        let runs = h.store.pipeline_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].pipeline_schedule_id, Some(hourly.id));
        assert_eq!(
            runs[0].execution_date,
            Utc.with_ymd_and_hms(2024, 3, 14, 15, 0, 0).unwrap()
        );
        assert!(h.store.schedules()[0].last_enqueued_at.is_some());
        assert_eq!(h.spawner.spawned_blocks(), vec!["a"]);

        for _ in 0..3 {
            assert_eq!(scheduler.schedule().await.runs_created, 0);
        }
        assert_eq!(h.store.pipeline_runs().len(), 1);

        h.clock.advance(chrono::Duration::hours(1));
        assert_eq!(scheduler.schedule().await.runs_created, 1);
        assert_eq!(h.store.pipeline_runs().len(), 2);
    }

    #[tokio::test]
    async fn test_once_schedule_runs_once() {
        let h = harness(4);
        h.store
            .add_pipeline(pipeline("etl", vec![block("a", &[])]))
            .unwrap();
        h.store.add_schedule(schedule("etl", "@once")).unwrap();
        let scheduler = Scheduler::new(h.context.clone(), false);

        assert_eq!(scheduler.schedule().await.runs_created, 1);
        h.clock.advance(chrono::Duration::days(2));
        assert_eq!(scheduler.schedule().await.runs_created, 0);
    }

    #[tokio::test]
    async fn test_failing_schedule_does_not_stop_tick() {
        let h = harness(4);
        h.store
            .add_pipeline(pipeline("etl", vec![block("a", &[])]))
            .unwrap();
        h.store.add_schedule(schedule("missing", "@daily")).unwrap();
        h.store.add_schedule(schedule("etl", "@daily")).unwrap();
        let scheduler = Scheduler::new(h.context.clone(), false);

        let report = scheduler.schedule().await;
        assert_eq!(report.runs_created, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(h.store.pipeline_runs()[0].pipeline_uuid, "etl");
    }

    #[tokio::test]
    async fn test_schedule_variables_override_pipeline_variables() {
        let h = harness(4);
        let mut p = pipeline("etl", vec![block("a", &[])]);
        p.variables.insert("env".to_string(), json!("staging"));
        p.variables.insert("batch".to_string(), json!(100));
        h.store.add_pipeline(p).unwrap();

        let mut s = schedule("etl", "@hourly");
        s.variables.insert("env".to_string(), json!("prod"));
        h.store.add_schedule(s).unwrap();

        Scheduler::new(h.context.clone(), false).schedule().await;

        let run = &h.store.pipeline_runs()[0];
        assert_eq!(run.variables.get("env"), Some(&json!("prod")));
        assert_eq!(run.variables.get("batch"), Some(&json!(100)));
        assert_eq!(
            h.spawner.block_executions()[0].variables.get("env"),
            Some(&json!("prod"))
        );
    }

    #[tokio::test]
    async fn test_triggered_run_progresses_through_ticks() {
        let h = harness(4);
        h.store
            .add_pipeline(pipeline("etl", vec![block("a", &[]), block("b", &["a"])]))
            .unwrap();
        let scheduler = Scheduler::new(h.context.clone(), false);

        let run = scheduler
            .trigger_pipeline("etl", HashMap::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Initial);
        assert!(run.pipeline_schedule_id.is_none());
        assert_eq!(h.store.block_runs(run.id).await.unwrap().len(), 2);
        assert!(h.spawner.spawned_blocks().is_empty());

        scheduler.schedule().await;
        h.spawner.block_handle("a").exit(Some(0));
        scheduler.schedule().await;
        h.spawner.block_handle("b").exit(Some(0));
        scheduler.schedule().await;

        let run = h.store.find_pipeline_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(h.registry.block_processes().is_empty());

        assert!(matches!(
            scheduler.trigger_pipeline("missing", HashMap::new()).await,
            Err(SchedulerError::PipelineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_swept() {
        let h = harness(4);
        h.store
            .add_pipeline(pipeline("etl", vec![block("a", &[]), block("b", &[])]))
            .unwrap();
        let scheduler = Scheduler::new(h.context.clone(), false);

        let run = scheduler
            .trigger_pipeline("etl", HashMap::new())
            .await
            .unwrap();
        scheduler.schedule().await;
        assert_eq!(h.registry.block_processes()[&run.id].len(), 2);

        let cancelled = scheduler.cancel_pipeline_run(run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);

        let report = scheduler.schedule().await;
        assert_eq!(report.runs_advanced, 0);
        assert!(h.registry.block_processes().is_empty());

        assert!(matches!(
            scheduler.cancel_pipeline_run(Uuid::new_v4()).await,
            Err(SchedulerError::PipelineRunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rerun_block_through_scheduler() {
        let h = harness(4);
        h.store
            .add_pipeline(pipeline("etl", vec![block("a", &[])]))
            .unwrap();
        let scheduler = Scheduler::new(h.context.clone(), false);

        let run = scheduler
            .trigger_pipeline("etl", HashMap::new())
            .await
            .unwrap();
        scheduler.schedule().await;
        h.spawner.block_handle("a").exit(Some(1));
        scheduler.schedule().await;

        let rerun = scheduler.rerun_block(run.id, "a").await.unwrap();
        assert_eq!(rerun.status, RunStatus::Running);

        scheduler.schedule().await;
        assert_eq!(h.spawner.spawned_blocks(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_sweep_reaps_children_when_enabled() {
        let h = harness(4);
        h.store
            .add_pipeline(pipeline("etl", vec![block("a", &[])]))
            .unwrap();
        let scheduler = Scheduler::new(h.context.clone(), true);

        let run = scheduler
            .trigger_pipeline("etl", HashMap::new())
            .await
            .unwrap();
        let orphan = FakeHandle::alive();
        h.registry.set_pipeline_process(run.id, orphan.clone());
        h.store
            .update_pipeline_run(
                run.id,
                PipelineRunUpdate::finished(RunStatus::Failed, h.clock.now()),
            )
            .await
            .unwrap();

        scheduler.schedule().await;

        assert_eq!(orphan.child_terminations(), 1);
        assert!(!h.registry.has_pipeline_process(run.id));
    }
}
