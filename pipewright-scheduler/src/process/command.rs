//! Shell command execution units
//!
//! Handles the OS side of block execution:
//! - Spawning block commands through a shell in their own process group
//! - Exporting run metadata and run variables as environment variables
//! - Polling child processes for exit without blocking
//! - Signalling a process, or its whole process group, on termination
//!
//! On Unix, termination runs the `kill` utility found on the scheduler's
//! `PATH` (`kill -s TERM -- <pid>` or `-<pgid>`). Without it every
//! termination fails with [`SchedulerError::Signal`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{BlockExecution, PipelineExecution, ProcessHandle, ProcessSpawner, SharedHandle};
use crate::error::{Result, SchedulerError};

/// Spawns block commands as `<shell> -c <command>`
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl CommandSpawner {
    /// Creates a new spawner
    ///
    /// # Arguments
    /// * `shell` - Shell used to interpret block commands (e.g., "/bin/sh")
    /// * `working_dir` - Working directory of spawned processes, inherited when `None`
    pub fn new(shell: String, working_dir: Option<PathBuf>) -> Self {
        Self { shell, working_dir }
    }

    fn spawn(&self, label: String, script: &str, env: HashMap<String, String>) -> Result<SharedHandle> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .envs(env)
            .stdin(Stdio::null());

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        // Own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|source| SchedulerError::Spawn {
            target: label.clone(),
            source,
        })?;

        info!("Spawned {} (pid {})", label, child.id());

        Ok(Arc::new(CommandHandle::new(label, child)))
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn_block(&self, execution: &BlockExecution) -> Result<SharedHandle> {
        let mut env = variables_env(&execution.variables);
        env.insert("PIPELINE_UUID".to_string(), execution.pipeline_uuid.clone());
        env.insert(
            "PIPELINE_RUN_ID".to_string(),
            execution.pipeline_run_id.to_string(),
        );
        env.insert("BLOCK_UUID".to_string(), execution.block_uuid.clone());
        env.insert("BLOCK_RUN_ID".to_string(), execution.block_run_id.to_string());
        env.insert(
            "EXECUTION_DATE".to_string(),
            execution.execution_date.to_rfc3339(),
        );

        let label = format!(
            "block '{}' of run {}",
            execution.block_uuid, execution.pipeline_run_id
        );
        self.spawn(label, &execution.command, env)
    }

    fn spawn_pipeline(&self, execution: &PipelineExecution) -> Result<SharedHandle> {
        let mut env = variables_env(&execution.variables);
        env.insert("PIPELINE_UUID".to_string(), execution.pipeline_uuid.clone());
        env.insert(
            "PIPELINE_RUN_ID".to_string(),
            execution.pipeline_run_id.to_string(),
        );
        env.insert(
            "EXECUTION_DATE".to_string(),
            execution.execution_date.to_rfc3339(),
        );

        let label = format!(
            "pipeline '{}' run {}",
            execution.pipeline_uuid, execution.pipeline_run_id
        );
        self.spawn(label, &pipeline_script(&execution.blocks), env)
    }
}

/// Runs every block in order inside one shell, stopping at the first failure
fn pipeline_script(blocks: &[(String, String)]) -> String {
    let mut script = String::from("set -e\n");
    for (uuid, command) in blocks {
        script.push_str(&format!("export BLOCK_UUID={}\n", shell_quote(uuid)));
        script.push_str(&format!("( {} )\n", command));
    }
    script
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn variables_env(variables: &HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    variables
        .iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Handle to a spawned child process
pub struct CommandHandle {
    label: String,
    pid: u32,
    state: Mutex<ChildState>,
}

struct ChildState {
    child: Child,
    exited: bool,
    exit_code: Option<i32>,
}

impl CommandHandle {
    pub fn new(label: String, child: Child) -> Self {
        Self {
            label,
            pid: child.id(),
            state: Mutex::new(ChildState {
                child,
                exited: false,
                exit_code: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reaps the child if it has exited; returns whether it has
    fn poll(&self) -> bool {
        let mut state = self.state();
        if state.exited {
            return true;
        }

        match state.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited with {}", self.label, status);
                state.exited = true;
                state.exit_code = status.code();
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to poll {}: {}", self.label, e);
                state.exited = true;
                true
            }
        }
    }

    #[cfg(unix)]
    fn signal(&self, target: String) -> Result<()> {
        let output = Command::new("kill")
            .arg("-s")
            .arg("TERM")
            .arg("--")
            .arg(&target)
            .output()
            .map_err(|e| SchedulerError::Signal {
                pid: self.pid,
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SchedulerError::Signal {
                pid: self.pid,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn signal(&self, _target: String) -> Result<()> {
        self.state()
            .child
            .kill()
            .map_err(|e| SchedulerError::Signal {
                pid: self.pid,
                message: e.to_string(),
            })
    }
}

impl ProcessHandle for CommandHandle {
    fn is_alive(&self) -> bool {
        !self.poll()
    }

    fn terminate(&self) -> Result<()> {
        if self.poll() {
            return Ok(());
        }
        debug!("Terminating {} (pid {})", self.label, self.pid);
        self.signal(self.pid.to_string())
    }

    fn terminate_children(&self) -> Result<()> {
        debug!("Terminating process group of {} (pgid {})", self.label, self.pid);
        // The group outlives its leader when descendants keep running
        let result = self.signal(format!("-{}", self.pid));
        self.poll();
        result
    }

    fn exit_code(&self) -> Option<i32> {
        if self.poll() {
            self.state().exit_code
        } else {
            None
        }
    }
}
