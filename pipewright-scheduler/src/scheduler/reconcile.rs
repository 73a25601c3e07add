//! Recording process exits into the run store
//!
//! Both the per-run scheduler and the registry sweep may be the first to see
//! a process exit; whichever does records it. Records that already moved on
//! from RUNNING are left alone, so recording twice is harmless.

use chrono::{DateTime, Utc};
use pipewright_core::domain::run::RunStatus;
use pipewright_core::dto::run::{BlockRunUpdate, PipelineRunUpdate};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::RunStore;

/// Records the exit of a block run's process
///
/// Returns whether the block run was updated.
pub(crate) async fn record_block_exit(
    store: &dyn RunStore,
    block_run_id: Uuid,
    exit_code: Option<i32>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(block_run) = store.find_block_run(block_run_id).await? else {
        return Ok(false);
    };

    if block_run.status != RunStatus::Running {
        return Ok(false);
    }

    let updated = store
        .update_block_run(block_run_id, BlockRunUpdate::exited(exit_code, now))
        .await?;

    info!(
        "Block run {} ({}) finished with status {:?}",
        updated.id, updated.block_uuid, updated.status
    );

    Ok(true)
}

/// Records the exit of the process that executed a whole pipeline run
///
/// Every unfinished block run shares the outcome of the process.
pub(crate) async fn record_pipeline_exit(
    store: &dyn RunStore,
    pipeline_run_id: Uuid,
    exit_code: Option<i32>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(run) = store.find_pipeline_run(pipeline_run_id).await? else {
        return Ok(false);
    };

    if run.status != RunStatus::Running {
        return Ok(false);
    }

    for block_run in store.block_runs(pipeline_run_id).await? {
        if block_run.status.is_active() {
            store
                .update_block_run(block_run.id, BlockRunUpdate::exited(exit_code, now))
                .await?;
        }
    }

    let status = if exit_code == Some(0) {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    };

    store
        .update_pipeline_run(pipeline_run_id, PipelineRunUpdate::finished(status, now))
        .await?;

    info!(
        "Pipeline run {} finished with status {:?}",
        pipeline_run_id, status
    );

    Ok(true)
}
