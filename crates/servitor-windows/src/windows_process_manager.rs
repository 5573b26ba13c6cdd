use anyhow::Result;
use async_trait::async_trait;
use servitor_core::{
    ChildInput, ChildOutput, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessPipes, ProcessStatus, ProcessTermination, TerminationResult,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    child: Child,
    command: String,
    args: Vec<String>,
}

impl WindowsProcessHandle {
    pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
        Self {
            child,
            command,
            args,
        }
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.child.id().map(ProcessId::from)
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn get_args(&self) -> &[String] {
        &self.args
    }

    fn take_pipes(&mut self) -> ProcessPipes {
        ProcessPipes {
            stdin: self.child.stdin.take().map(|s| Box::new(s) as ChildInput),
            stdout: self.child.stdout.take().map(|s| Box::new(s) as ChildOutput),
            stderr: self.child.stderr.take().map(|s| Box::new(s) as ChildOutput),
        }
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        // Windows has no signals; a forced kill surfaces as exit code 1
        Ok(self
            .child
            .try_wait()?
            .map(|status| ProcessStatus::Exited {
                code: status.code(),
            }))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
    }
}

/// Windows-specific process manager built on taskkill
pub struct WindowsProcessManager {
    system: Arc<std::sync::Mutex<System>>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    type Handle = WindowsProcessHandle;

    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle, std::io::Error> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in env {
            cmd.env(key, value);
        }

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW; the console lives in our pipes
            cmd.creation_flags(0x08000000);
        }

        let child = cmd.spawn()?;

        if let Some(pid) = child.id() {
            info!(
                pid = %pid,
                command = %command,
                args = ?args,
                "Spawned Windows process"
            );
        }

        Ok(WindowsProcessHandle::new(
            child,
            command.to_string(),
            args.to_vec(),
        ))
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        match self.taskkill(pid.0).await {
            Ok(true) => {
                info!(pid = %pid.0, "Sent termination request to process");
                TerminationResult::Success
            }
            Ok(false) => {
                warn!(pid = %pid.0, "taskkill rejected the termination request");
                TerminationResult::Failed("taskkill exited with an error".to_string())
            }
            Err(e) => {
                warn!(pid = %pid.0, error = %e, "Failed to request process termination");
                TerminationResult::Failed(format!("Termination request failed: {e}"))
            }
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        // /T takes the whole tree down with the root
        match self.taskkill_tree(pid.0).await {
            Ok(true) => {
                info!(pid = %pid.0, "Force killed process tree");
                if let Err(e) = handle.kill().await {
                    warn!(error = %e, "Handle kill cleanup failed");
                }
                TerminationResult::Success
            }
            Ok(false) => {
                // taskkill also fails when the tree is already gone; fall back to the handle
                match handle.kill().await {
                    Ok(()) => TerminationResult::Success,
                    Err(_) => {
                        info!(pid = %pid.0, "Process not found for force kill");
                        TerminationResult::ProcessNotFound
                    }
                }
            }
            Err(e) => {
                warn!(pid = %pid.0, error = %e, "Failed to force kill process");
                TerminationResult::Failed(format!("Force kill failed: {e}"))
            }
        }
    }

    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
        // A full process table refresh is slow; keep it off the async workers
        let system = Arc::clone(&self.system);
        let children = tokio::task::spawn_blocking(move || {
            let mut system = system
                .lock()
                .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);
            Ok::<_, anyhow::Error>(children)
        })
        .await??;

        Ok(children.into_iter().map(ProcessId::from).collect())
    }
}

impl WindowsProcessManager {
    /// Ask a single process to close with taskkill, without /F
    async fn taskkill(&self, pid: u32) -> Result<bool> {
        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(output.status.success())
    }

    /// Use taskkill with /T to terminate a process tree
    async fn taskkill_tree(&self, pid: u32) -> Result<bool> {
        let output = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(output.status.success())
    }

    /// Recursively find all child processes, deepest first
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        info!("Initializing Windows process manager with system monitoring");
        Self {
            system: Arc::new(std::sync::Mutex::new(System::new())),
        }
    }

    fn platform_name(&self) -> &'static str {
        "Windows"
    }
}
