//! Scheduler configuration
//!
//! Defines all configurable parameters for the scheduler including the
//! project file, the tick interval, and how block processes are started.

use std::path::PathBuf;
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON file declaring pipelines and schedules
    pub project_file: PathBuf,

    /// How often the scheduling tick runs
    pub tick_interval: Duration,

    /// Block runs executing at once within one pipeline run, unless the
    /// pipeline sets its own limit
    pub max_concurrent_blocks: usize,

    /// Whether the sweep also terminates the descendants of processes whose
    /// run is no longer active
    pub reap_child_processes: bool,

    /// Shell used to run block commands (`<shell> -c <command>`)
    pub block_shell: String,

    /// Working directory of spawned processes, the scheduler's own when unset
    pub working_dir: Option<PathBuf>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(project_file: PathBuf) -> Self {
        Self {
            project_file,
            tick_interval: Duration::from_secs(10),
            max_concurrent_blocks: 4,
            reap_child_processes: true,
            block_shell: "/bin/sh".to_string(),
            working_dir: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - PROJECT_FILE (required)
    /// - TICK_INTERVAL (optional, seconds, default: 10)
    /// - MAX_CONCURRENT_BLOCKS (optional, default: 4)
    /// - REAP_CHILD_PROCESSES (optional, true/false, default: true)
    /// - BLOCK_SHELL (optional, default: /bin/sh)
    /// - WORKING_DIR (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from any key/value source using the
    /// environment variable names of [`Config::from_env`]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let project_file = lookup("PROJECT_FILE")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("PROJECT_FILE environment variable not set"))?;

        let mut config = Self::new(project_file);

        if let Some(interval) = lookup("TICK_INTERVAL").and_then(|s| s.parse::<u64>().ok()) {
            config.tick_interval = Duration::from_secs(interval);
        }

        if let Some(max) = lookup("MAX_CONCURRENT_BLOCKS").and_then(|s| s.parse::<usize>().ok()) {
            config.max_concurrent_blocks = max;
        }

        if let Some(reap) = lookup("REAP_CHILD_PROCESSES").and_then(|s| s.parse::<bool>().ok()) {
            config.reap_child_processes = reap;
        }

        if let Some(shell) = lookup("BLOCK_SHELL") {
            config.block_shell = shell;
        }

        if let Some(dir) = lookup("WORKING_DIR") {
            config = config.with_working_dir(dir);
        }

        Ok(config)
    }

    /// Sets the working directory of spawned processes
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project_file.as_os_str().is_empty() {
            anyhow::bail!("project_file cannot be empty");
        }

        if self.tick_interval.is_zero() {
            anyhow::bail!("tick_interval must be greater than 0");
        }

        if self.max_concurrent_blocks == 0 {
            anyhow::bail!("max_concurrent_blocks must be greater than 0");
        }

        if self.block_shell.trim().is_empty() {
            anyhow::bail!("block_shell cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(PathBuf::from("pipewright.json"))
    }
}
