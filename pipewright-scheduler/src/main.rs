//! Pipewright Scheduler service
//!
//! Loads the project file into the in-memory run store, wires the process
//! registry and the command spawner, then runs the scheduling tick on a
//! fixed interval until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipewright_scheduler::clock::SystemClock;
use pipewright_scheduler::config::Config;
use pipewright_scheduler::process::{CommandSpawner, ProcessRegistry};
use pipewright_scheduler::repository::{InMemoryRunStore, ProjectDefinition};
use pipewright_scheduler::scheduler::{Scheduler, SchedulerContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipewright_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Pipewright Scheduler");

    let config = load_config()?;
    info!(
        "Loaded configuration: project_file={}, max_concurrent_blocks={}",
        config.project_file.display(),
        config.max_concurrent_blocks
    );
    #[cfg(unix)]
    debug!("Processes are terminated through the `kill` utility on PATH");

    let project = ProjectDefinition::load(&config.project_file).with_context(|| {
        format!(
            "Failed to load project file {}",
            config.project_file.display()
        )
    })?;
    let store = Arc::new(
        InMemoryRunStore::from_project(project).context("Failed to seed run store")?,
    );

    let clock = Arc::new(SystemClock);
    let registry = Arc::new(ProcessRegistry::new(store.clone(), clock.clone()));
    let spawner = Arc::new(CommandSpawner::new(
        config.block_shell.clone(),
        config.working_dir.clone(),
    ));

    let context = SchedulerContext {
        store,
        registry: registry.clone(),
        spawner,
        clock,
        max_concurrent_blocks: config.max_concurrent_blocks,
    };
    let scheduler = Scheduler::new(context, config.reap_child_processes);

    info!("Scheduler initialized successfully");

    scheduler
        .run(config.tick_interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    let pipelines = registry.pipeline_processes().len();
    let blocks: usize = registry.block_processes().values().map(|b| b.len()).sum();
    if pipelines + blocks > 0 {
        warn!(
            "Exiting with {} pipeline process(es) and {} block process(es) still registered",
            pipelines, blocks
        );
    }

    info!("Pipewright Scheduler stopped");
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(_) => {
            info!("Failed to load config from environment, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
