//! Scheduler layer
//!
//! The scheduling tick creates runs for due schedules and advances every
//! active run; the pipeline scheduler performs one advancement step for a
//! single run. Both share the same set of collaborators.

pub mod pipeline;
pub(crate) mod reconcile;
pub mod tick;

pub use pipeline::PipelineScheduler;
pub use tick::{Scheduler, TickReport};

use std::sync::Arc;

use crate::clock::Clock;
use crate::process::{ProcessRegistry, ProcessSpawner};
use crate::repository::RunStore;

/// Collaborators shared by the tick and every pipeline scheduler
#[derive(Clone)]
pub struct SchedulerContext {
    pub store: Arc<dyn RunStore>,
    pub registry: Arc<ProcessRegistry>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub clock: Arc<dyn Clock>,
    /// Block runs allowed to execute at once within one pipeline run,
    /// unless the pipeline sets its own limit
    pub max_concurrent_blocks: usize,
}
