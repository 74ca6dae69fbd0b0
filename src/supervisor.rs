//! Control Process Supervision
//!
//! The external control plane (POX by default) only runs on the elected
//! master. The coordinator drives it through `ControlProcessSupervisor`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::ControlConfig;
use crate::error::{Error, Result};

/// Starts and stops the external control process
#[async_trait]
pub trait ControlProcessSupervisor: Send + Sync {
    /// Launch the control process from `path` with `options`
    async fn start_control_process(&self, path: &Path, options: &[String]) -> Result<()>;

    /// Stop the control process; a no-op when nothing is running
    async fn stop_control_process(&self) -> Result<()>;
}

/// Runs `<program> <script> <options...>` as a child process
pub struct ProcessSupervisor {
    program: String,
    script: String,
    child: Mutex<Option<Child>>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            child: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::new(config.program.clone(), config.script.clone())
    }

    /// Check whether the child in `slot` is running; an exited child is
    /// reaped and cleared
    fn reap(slot: &mut Option<Child>) -> bool {
        match slot.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                tracing::warn!("Control process exited on its own ({})", status);
                *slot = None;
                false
            }
            Some(Err(e)) => {
                tracing::warn!("Failed to poll control process: {}", e);
                false
            }
            None => false,
        }
    }

    fn command(&self, path: &Path, options: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .args(options)
            .current_dir(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Forward the child's output into our logs
fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "ctlgroup::control", "{}", line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "ctlgroup::control", "{}", line);
            }
        });
    }
}

#[async_trait]
impl ControlProcessSupervisor for ProcessSupervisor {
    async fn start_control_process(&self, path: &Path, options: &[String]) -> Result<()> {
        let mut guard = self.child.lock().await;

        if Self::reap(&mut guard) {
            tracing::debug!("Control process already running");
            return Ok(());
        }

        let mut child = self.command(path, options).spawn().map_err(|e| {
            Error::ControlProcess(format!(
                "Failed to launch '{} {}' in {}: {}",
                self.program,
                self.script,
                path.display(),
                e
            ))
        })?;

        tracing::info!(
            "Started control process {} {} {} (pid {:?})",
            self.program,
            self.script,
            options.join(" "),
            child.id()
        );

        forward_output(&mut child);
        *guard = Some(child);
        Ok(())
    }

    async fn stop_control_process(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        let pid = child.id();
        child
            .kill()
            .await
            .map_err(|e| Error::ControlProcess(format!("Failed to kill control process: {}", e)))?;

        tracing::info!("Stopped control process (pid {:?})", pid);
        Ok(())
    }
}
