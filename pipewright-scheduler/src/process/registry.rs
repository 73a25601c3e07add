//! Process registry
//!
//! Tracks which execution unit is running for each pipeline run and each
//! block run:
//! - At most one pipeline-level process per pipeline run; registering a new
//!   one terminates the previous one first
//! - Block-level processes keyed by `(pipeline run, block run)`; registering
//!   over an existing entry replaces it without terminating it, so callers
//!   check liveness before dispatching
//! - A periodic sweep drops entries of exited processes and of finished or
//!   cancelled runs, recording exits the schedulers have not seen yet
//!
//! Both tables sit behind one mutex that is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SharedHandle;
use crate::clock::Clock;
use crate::repository::RunStore;
use crate::scheduler::reconcile;
use pipewright_core::domain::run::RunStatus;

/// Composite key of a block-level process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockProcessKey {
    pub pipeline_run_id: Uuid,
    pub block_run_id: Uuid,
}

#[derive(Default)]
struct ProcessTables {
    pipeline_processes: HashMap<Uuid, SharedHandle>,
    block_processes: HashMap<BlockProcessKey, SharedHandle>,
}

/// Registry of live execution units
pub struct ProcessRegistry {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    tables: Mutex<ProcessTables>,
}

impl ProcessRegistry {
    pub fn new(store: Arc<dyn RunStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            tables: Mutex::new(ProcessTables::default()),
        }
    }

    fn tables(&self) -> MutexGuard<'_, ProcessTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_pipeline_process(&self, pipeline_run_id: Uuid) -> bool {
        self.tables().pipeline_processes.contains_key(&pipeline_run_id)
    }

    pub fn pipeline_process(&self, pipeline_run_id: Uuid) -> Option<SharedHandle> {
        self.tables().pipeline_processes.get(&pipeline_run_id).cloned()
    }

    /// Registers the pipeline-level process of a run
    ///
    /// Any process already registered for the run is terminated first.
    pub fn set_pipeline_process(&self, pipeline_run_id: Uuid, handle: SharedHandle) {
        self.terminate_pipeline_process(pipeline_run_id);
        self.tables()
            .pipeline_processes
            .insert(pipeline_run_id, handle);
    }

    /// Best-effort termination of the pipeline-level process of a run
    ///
    /// The entry stays registered; the sweep removes it once the process is gone.
    pub fn terminate_pipeline_process(&self, pipeline_run_id: Uuid) {
        if let Some(handle) = self.pipeline_process(pipeline_run_id) {
            terminate_if_alive(&handle, || format!("pipeline process of run {}", pipeline_run_id));
        }
    }

    pub fn has_block_process(&self, pipeline_run_id: Uuid, block_run_id: Uuid) -> bool {
        self.block_process(pipeline_run_id, block_run_id).is_some()
    }

    pub fn block_process(&self, pipeline_run_id: Uuid, block_run_id: Uuid) -> Option<SharedHandle> {
        let key = BlockProcessKey {
            pipeline_run_id,
            block_run_id,
        };
        self.tables().block_processes.get(&key).cloned()
    }

    /// Registers the process of a block run
    ///
    /// Last write wins: a previous entry for the same block run is replaced
    /// without being terminated.
    pub fn set_block_process(&self, pipeline_run_id: Uuid, block_run_id: Uuid, handle: SharedHandle) {
        let key = BlockProcessKey {
            pipeline_run_id,
            block_run_id,
        };
        self.tables().block_processes.insert(key, handle);
    }

    /// Terminates the live process of a block run, whichever run owns it
    ///
    /// Returns whether a live process was signalled.
    pub fn terminate_block_process(&self, block_run_id: Uuid) -> bool {
        let handles: Vec<SharedHandle> = self
            .tables()
            .block_processes
            .iter()
            .filter(|(key, _)| key.block_run_id == block_run_id)
            .map(|(_, handle)| handle.clone())
            .collect();

        handles.iter().fold(false, |signalled, handle| {
            terminate_if_alive(handle, || format!("process of block run {}", block_run_id)) || signalled
        })
    }

    /// Terminates every live block process of a pipeline run
    ///
    /// Returns the number of processes signalled.
    pub fn terminate_block_processes(&self, pipeline_run_id: Uuid) -> usize {
        let handles: Vec<(Uuid, SharedHandle)> = self
            .tables()
            .block_processes
            .iter()
            .filter(|(key, _)| key.pipeline_run_id == pipeline_run_id)
            .map(|(key, handle)| (key.block_run_id, handle.clone()))
            .collect();

        handles
            .iter()
            .filter(|(block_run_id, handle)| {
                terminate_if_alive(handle, || format!("process of block run {}", block_run_id))
            })
            .count()
    }

    /// Snapshot of the pipeline-level processes
    pub fn pipeline_processes(&self) -> HashMap<Uuid, SharedHandle> {
        self.tables().pipeline_processes.clone()
    }

    /// Snapshot of the block-level processes, grouped by pipeline run
    pub fn block_processes(&self) -> HashMap<Uuid, HashMap<Uuid, SharedHandle>> {
        let mut grouped: HashMap<Uuid, HashMap<Uuid, SharedHandle>> = HashMap::new();
        for (key, handle) in &self.tables().block_processes {
            grouped
                .entry(key.pipeline_run_id)
                .or_default()
                .insert(key.block_run_id, handle.clone());
        }
        grouped
    }

    /// Sweeps entries that no longer back an active run
    ///
    /// An entry is removed when its process has exited or its pipeline run is
    /// cancelled, finished or unknown to the store. With
    /// `include_child_processes`, removed processes that are still alive are
    /// terminated together with their descendants; otherwise only the
    /// bookkeeping is cleaned. Exits of runs still marked RUNNING are
    /// recorded before the entry disappears; an entry whose exit could not
    /// be recorded stays for the next sweep.
    pub async fn clean_up_processes(&self, include_child_processes: bool) {
        let (block_entries, pipeline_entries) = {
            let tables = self.tables();
            let blocks: Vec<(BlockProcessKey, SharedHandle)> = tables
                .block_processes
                .iter()
                .map(|(key, handle)| (*key, handle.clone()))
                .collect();
            let pipelines: Vec<(Uuid, SharedHandle)> = tables
                .pipeline_processes
                .iter()
                .map(|(id, handle)| (*id, handle.clone()))
                .collect();
            (blocks, pipelines)
        };

        if block_entries.is_empty() && pipeline_entries.is_empty() {
            return;
        }

        let mut statuses: HashMap<Uuid, Option<RunStatus>> = HashMap::new();
        let mut removed = 0;

        for (key, handle) in block_entries {
            let Some(status) = self.run_status(key.pipeline_run_id, &mut statuses).await else {
                continue;
            };
            let alive = handle.is_alive();
            if alive && status.is_some_and(RunStatus::is_active) {
                continue;
            }

            // The exit is recorded while the entry still backs the block run,
            // so a failed write leaves it for the next sweep
            if !alive {
                if !self.block_entry_is(&key, &handle) {
                    continue;
                }
                if let Err(e) = reconcile::record_block_exit(
                    self.store.as_ref(),
                    key.block_run_id,
                    handle.exit_code(),
                    self.clock.now(),
                )
                .await
                {
                    warn!(
                        "Failed to record exit of block run {}, keeping its entry: {}",
                        key.block_run_id, e
                    );
                    continue;
                }
            }

            if !self.remove_block_entry(&key, &handle) {
                continue;
            }
            removed += 1;

            if alive && include_child_processes {
                tear_down(&handle, || format!("block run {}", key.block_run_id));
            }
        }

        for (pipeline_run_id, handle) in pipeline_entries {
            let Some(status) = self.run_status(pipeline_run_id, &mut statuses).await else {
                continue;
            };
            let alive = handle.is_alive();
            if alive && status.is_some_and(RunStatus::is_active) {
                continue;
            }

            if !alive {
                if !self.pipeline_entry_is(pipeline_run_id, &handle) {
                    continue;
                }
                if let Err(e) = reconcile::record_pipeline_exit(
                    self.store.as_ref(),
                    pipeline_run_id,
                    handle.exit_code(),
                    self.clock.now(),
                )
                .await
                {
                    warn!(
                        "Failed to record exit of pipeline run {}, keeping its entry: {}",
                        pipeline_run_id, e
                    );
                    continue;
                }
            }

            if !self.remove_pipeline_entry(pipeline_run_id, &handle) {
                continue;
            }
            removed += 1;

            if alive && include_child_processes {
                tear_down(&handle, || format!("pipeline run {}", pipeline_run_id));
            }
        }

        if removed > 0 {
            info!("Cleaned up {} process entr(ies)", removed);
        }
    }

    fn block_entry_is(&self, key: &BlockProcessKey, handle: &SharedHandle) -> bool {
        self.tables()
            .block_processes
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    fn pipeline_entry_is(&self, pipeline_run_id: Uuid, handle: &SharedHandle) -> bool {
        self.tables()
            .pipeline_processes
            .get(&pipeline_run_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Removes the entry only if it still holds `handle`
    fn remove_block_entry(&self, key: &BlockProcessKey, handle: &SharedHandle) -> bool {
        let mut tables = self.tables();
        match tables.block_processes.get(key) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                tables.block_processes.remove(key);
                true
            }
            _ => false,
        }
    }

    fn remove_pipeline_entry(&self, pipeline_run_id: Uuid, handle: &SharedHandle) -> bool {
        let mut tables = self.tables();
        match tables.pipeline_processes.get(&pipeline_run_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                tables.pipeline_processes.remove(&pipeline_run_id);
                true
            }
            _ => false,
        }
    }

    /// Status of a pipeline run, cached for the duration of one sweep
    ///
    /// Outer `None` means the store could not be asked; inner `None` means
    /// the run does not exist.
    async fn run_status(
        &self,
        pipeline_run_id: Uuid,
        cache: &mut HashMap<Uuid, Option<RunStatus>>,
    ) -> Option<Option<RunStatus>> {
        if let Some(status) = cache.get(&pipeline_run_id) {
            return Some(*status);
        }

        match self.store.find_pipeline_run(pipeline_run_id).await {
            Ok(run) => {
                let status = run.map(|r| r.status);
                cache.insert(pipeline_run_id, status);
                Some(status)
            }
            Err(e) => {
                warn!(
                    "Skipping cleanup of run {}, status lookup failed: {}",
                    pipeline_run_id, e
                );
                None
            }
        }
    }
}

/// Signals the process if it is still running; failures are logged, never raised
fn terminate_if_alive(handle: &SharedHandle, describe: impl Fn() -> String) -> bool {
    if !handle.is_alive() {
        return false;
    }

    match handle.terminate() {
        Ok(()) => {
            info!("Terminated {}", describe());
            true
        }
        Err(e) => {
            debug!("Could not terminate {}: {}", describe(), e);
            false
        }
    }
}

fn tear_down(handle: &SharedHandle, describe: impl Fn() -> String) {
    match handle.terminate_children() {
        Ok(()) => info!("Terminated process tree of {}", describe()),
        Err(e) => debug!("Could not terminate process tree of {}: {}", describe(), e),
    }
}
