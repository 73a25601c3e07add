//! Test doubles shared by the unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pipewright_core::domain::pipeline::{BlockDefinition, ExecutionMode, Pipeline};
use pipewright_core::domain::run::{BlockRun, PipelineRun};
use pipewright_core::domain::schedule::{PipelineSchedule, ScheduleStatus};
use pipewright_core::dto::run::{
    BlockRunUpdate, CreateBlockRun, CreatePipelineRun, PipelineRunUpdate,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::process::{
    BlockExecution, PipelineExecution, ProcessHandle, ProcessRegistry, ProcessSpawner,
    SharedHandle,
};
use crate::repository::{InMemoryRunStore, RunStore};
use crate::scheduler::SchedulerContext;

/// Process handle whose liveness is controlled by the test
pub(crate) struct FakeHandle {
    alive: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    terminate_calls: AtomicUsize,
    child_terminations: AtomicUsize,
}

impl FakeHandle {
    pub(crate) fn alive() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            terminate_calls: AtomicUsize::new(0),
            child_terminations: AtomicUsize::new(0),
        })
    }

    pub(crate) fn exited(exit_code: Option<i32>) -> Arc<Self> {
        let handle = Self::alive();
        handle.exit(exit_code);
        handle
    }

    /// Simulates the process exiting on its own
    pub(crate) fn exit(&self, exit_code: Option<i32>) {
        *self.exit_code.lock().unwrap() = exit_code;
        self.alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn child_terminations(&self) -> usize {
        self.child_terminations.load(Ordering::SeqCst)
    }
}

impl ProcessHandle for FakeHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.exit(None);
        Ok(())
    }

    fn terminate_children(&self) -> Result<()> {
        self.child_terminations.fetch_add(1, Ordering::SeqCst);
        self.exit(None);
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        if self.is_alive() {
            None
        } else {
            *self.exit_code.lock().unwrap()
        }
    }
}

/// Spawner handing out [`FakeHandle`]s and remembering what it started
#[derive(Default)]
pub(crate) struct FakeSpawner {
    blocks: Mutex<Vec<(BlockExecution, Arc<FakeHandle>)>>,
    pipelines: Mutex<Vec<(PipelineExecution, Arc<FakeHandle>)>>,
    failing_blocks: Mutex<HashSet<String>>,
}

impl FakeSpawner {
    /// Makes every spawn of the block fail
    pub(crate) fn fail_block(&self, block_uuid: &str) {
        self.failing_blocks
            .lock()
            .unwrap()
            .insert(block_uuid.to_string());
    }

    /// Block uuids in spawn order
    pub(crate) fn spawned_blocks(&self) -> Vec<String> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .map(|(execution, _)| execution.block_uuid.clone())
            .collect()
    }

    /// Handle of the latest spawn of the block
    pub(crate) fn block_handle(&self, block_uuid: &str) -> Arc<FakeHandle> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(execution, _)| execution.block_uuid == block_uuid)
            .map(|(_, handle)| handle.clone())
            .unwrap_or_else(|| panic!("block '{}' was never spawned", block_uuid))
    }

    pub(crate) fn block_executions(&self) -> Vec<BlockExecution> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .map(|(execution, _)| execution.clone())
            .collect()
    }

    pub(crate) fn pipeline_spawns(&self) -> Vec<(PipelineExecution, Arc<FakeHandle>)> {
        self.pipelines.lock().unwrap().clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn_block(&self, execution: &BlockExecution) -> Result<SharedHandle> {
        if self.failing_blocks.lock().unwrap().contains(&execution.block_uuid) {
            return Err(SchedulerError::Spawn {
                target: execution.block_uuid.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such shell"),
            });
        }

        let handle = FakeHandle::alive();
        self.blocks
            .lock()
            .unwrap()
            .push((execution.clone(), handle.clone()));
        Ok(handle)
    }

    fn spawn_pipeline(&self, execution: &PipelineExecution) -> Result<SharedHandle> {
        let handle = FakeHandle::alive();
        self.pipelines
            .lock()
            .unwrap()
            .push((execution.clone(), handle.clone()));
        Ok(handle)
    }
}

type LookupHook = Box<dyn FnOnce() + Send>;

/// Run store over [`InMemoryRunStore`] whose failures are scripted by the test
pub(crate) struct ScriptedStore {
    inner: Arc<InMemoryRunStore>,
    fail_run_lookups: AtomicBool,
    fail_block_updates: AtomicBool,
    on_run_lookup: Mutex<Option<LookupHook>>,
}

impl ScriptedStore {
    pub(crate) fn new(inner: Arc<InMemoryRunStore>) -> Self {
        Self {
            inner,
            fail_run_lookups: AtomicBool::new(false),
            fail_block_updates: AtomicBool::new(false),
            on_run_lookup: Mutex::new(None),
        }
    }

    pub(crate) fn fail_run_lookups(&self, fail: bool) {
        self.fail_run_lookups.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_block_updates(&self, fail: bool) {
        self.fail_block_updates.store(fail, Ordering::SeqCst);
    }

    /// Runs `hook` once, at the start of the next pipeline run lookup
    pub(crate) fn on_next_run_lookup(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_run_lookup.lock().unwrap() = Some(Box::new(hook));
    }
}

fn unavailable() -> SchedulerError {
    SchedulerError::Io(std::io::Error::other("store unavailable"))
}

#[async_trait]
impl RunStore for ScriptedStore {
    async fn find_pipeline(&self, uuid: &str) -> Result<Option<Pipeline>> {
        self.inner.find_pipeline(uuid).await
    }

    async fn active_schedules(&self) -> Result<Vec<PipelineSchedule>> {
        self.inner.active_schedules().await
    }

    async fn mark_schedule_enqueued(&self, schedule_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_schedule_enqueued(schedule_id, at).await
    }

    async fn create_pipeline_run(&self, req: CreatePipelineRun) -> Result<PipelineRun> {
        self.inner.create_pipeline_run(req).await
    }

    async fn find_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>> {
        let hook = self.on_run_lookup.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.fail_run_lookups.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.find_pipeline_run(id).await
    }

    async fn active_pipeline_runs(&self) -> Result<Vec<PipelineRun>> {
        self.inner.active_pipeline_runs().await
    }

    async fn pipeline_runs_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<PipelineRun>> {
        self.inner.pipeline_runs_for_schedule(schedule_id).await
    }

    async fn update_pipeline_run(
        &self,
        id: Uuid,
        update: PipelineRunUpdate,
    ) -> Result<PipelineRun> {
        self.inner.update_pipeline_run(id, update).await
    }

    async fn create_block_run(&self, req: CreateBlockRun) -> Result<BlockRun> {
        self.inner.create_block_run(req).await
    }

    async fn find_block_run(&self, id: Uuid) -> Result<Option<BlockRun>> {
        self.inner.find_block_run(id).await
    }

    async fn block_runs(&self, pipeline_run_id: Uuid) -> Result<Vec<BlockRun>> {
        self.inner.block_runs(pipeline_run_id).await
    }

    async fn update_block_run(&self, id: Uuid, update: BlockRunUpdate) -> Result<BlockRun> {
        if self.fail_block_updates.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.update_block_run(id, update).await
    }
}

/// Clock that only moves when told to
pub(crate) struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2024, 3, 14, 15, 42, 0).unwrap())
    }
}

impl FixedClock {
    pub(crate) fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Fully wired dependencies over fakes
pub(crate) struct Harness {
    pub(crate) store: Arc<InMemoryRunStore>,
    pub(crate) spawner: Arc<FakeSpawner>,
    pub(crate) clock: Arc<FixedClock>,
    pub(crate) registry: Arc<ProcessRegistry>,
    pub(crate) context: SchedulerContext,
}

pub(crate) fn harness(max_concurrent_blocks: usize) -> Harness {
    let store = Arc::new(InMemoryRunStore::new());
    let spawner = Arc::new(FakeSpawner::default());
    let clock = Arc::new(FixedClock::default());
    let registry = Arc::new(ProcessRegistry::new(store.clone(), clock.clone()));

    let context = SchedulerContext {
        store: store.clone(),
        registry: registry.clone(),
        spawner: spawner.clone(),
        clock: clock.clone(),
        max_concurrent_blocks,
    };

    Harness {
        store,
        spawner,
        clock,
        registry,
        context,
    }
}

pub(crate) fn block(uuid: &str, upstream: &[&str]) -> BlockDefinition {
    BlockDefinition {
        uuid: uuid.to_string(),
        command: format!("echo {}", uuid),
        upstream_blocks: upstream.iter().map(|s| s.to_string()).collect(),
        retries: 0,
        timeout_seconds: None,
    }
}

pub(crate) fn pipeline(uuid: &str, blocks: Vec<BlockDefinition>) -> Pipeline {
    Pipeline {
        uuid: uuid.to_string(),
        name: None,
        execution_mode: ExecutionMode::PerBlock,
        blocks,
        concurrency: None,
        variables: HashMap::new(),
    }
}

pub(crate) fn schedule(pipeline_uuid: &str, interval: &str) -> PipelineSchedule {
    PipelineSchedule {
        id: Uuid::new_v4(),
        name: format!("{} {}", pipeline_uuid, interval),
        pipeline_uuid: pipeline_uuid.to_string(),
        schedule_interval: interval.to_string(),
        start_time: None,
        status: ScheduleStatus::Active,
        variables: HashMap::new(),
        last_enqueued_at: None,
    }
}

pub(crate) async fn create_run(store: &dyn RunStore, pipeline_uuid: &str) -> PipelineRun {
    store
        .create_pipeline_run(CreatePipelineRun {
            pipeline_uuid: pipeline_uuid.to_string(),
            pipeline_schedule_id: None,
            execution_date: Utc::now(),
            variables: HashMap::new(),
        })
        .await
        .unwrap()
}

pub(crate) async fn create_block_run(
    store: &dyn RunStore,
    pipeline_run_id: Uuid,
    block_uuid: &str,
) -> BlockRun {
    store
        .create_block_run(CreateBlockRun {
            pipeline_run_id,
            block_uuid: block_uuid.to_string(),
        })
        .await
        .unwrap()
}
