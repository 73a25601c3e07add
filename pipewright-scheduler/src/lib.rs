//! Pipewright Scheduler
//!
//! Decides which pipeline runs and block runs to start, tracks the OS
//! processes executing them, and reconciles process state against run
//! status on every scheduling tick.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repository: Run store trait plus the in-memory store seeded from a project file
//! - Process: Process handles, the spawn capability and the process registry
//! - Scheduler: The scheduling tick and the per-run pipeline scheduler

pub mod clock;
pub mod config;
pub mod error;
pub mod process;
pub mod repository;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SchedulerError};
