#[cfg(unix)]
mod unix_impl {
    use anyhow::Result;
    use async_trait::async_trait;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use servitor_core::{
        ChildInput, ChildOutput, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
        ProcessPipes, ProcessStatus, ProcessTermination, TerminationResult,
    };
    use std::collections::HashMap;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Stdio};
    use std::sync::Arc;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        command: String,
        args: Vec<String>,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
            Self {
                child,
                command,
                args,
            }
        }
    }

    fn exit_status(status: ExitStatus) -> ProcessStatus {
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessStatus::Exited { code: Some(code) },
            (None, Some(_)) => ProcessStatus::Terminated,
            (None, None) => ProcessStatus::Exited { code: None },
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
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
            Ok(self.child.try_wait()?.map(exit_status))
        }

        async fn kill(&mut self) -> Result<()> {
            // Reaping is left to try_wait so a stuck process cannot block the caller
            self.child
                .start_kill()
                .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
        }
    }

    /// Unix-specific process manager using signals and process tree discovery
    pub struct UnixProcessManager {
        system: Arc<std::sync::Mutex<System>>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    fn send_signal(pid: ProcessId, sig: Signal) -> TerminationResult {
        match signal::kill(NixPid::from_raw(pid.0 as i32), sig) {
            Ok(()) => {
                info!(pid = pid.0, signal = ?sig, "Sent signal to process");
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                info!(pid = pid.0, "Process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!(pid = pid.0, signal = ?sig, "Permission denied to signal process");
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!(pid = pid.0, signal = ?sig, error = %e, "Failed to signal process");
                TerminationResult::Failed(format!("{sig:?} failed: {e}"))
            }
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

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

            // Own process group so terminal signals aimed at us skip the child
            cmd.process_group(0);

            let child = cmd.spawn()?;

            if let Some(pid) = child.id() {
                info!(pid, command, ?args, "Spawned Unix process");
            }

            Ok(UnixProcessHandle::new(
                child,
                command.to_string(),
                args.to_vec(),
            ))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            match handle.get_pid() {
                Some(pid) => send_signal(pid, Signal::SIGTERM),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            match self.find_child_processes(pid).await {
                Ok(children) => {
                    if !children.is_empty() {
                        info!(pid = pid.0, count = children.len(), "Killing descendant processes");
                    }
                    for child in children {
                        if let TerminationResult::Failed(e) = send_signal(child, Signal::SIGKILL) {
                            warn!(pid = child.0, error = %e, "Failed to kill descendant");
                        }
                    }
                }
                Err(e) => warn!(pid = pid.0, error = %e, "Failed to enumerate descendants"),
            }

            let result = send_signal(pid, Signal::SIGKILL);
            if result == TerminationResult::Success {
                if let Err(e) = handle.kill().await {
                    debug!(error = %e, "Handle kill cleanup failed");
                }
            }
            result
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

    impl UnixProcessManager {
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

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager with system monitoring");
            Self {
                system: Arc::new(std::sync::Mutex::new(System::new())),
            }
        }

        fn platform_name(&self) -> &'static str {
            "Unix"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        fn sh(script: &str) -> Vec<String> {
            vec!["-c".to_string(), script.to_string()]
        }

        async fn wait_exit(handle: &mut UnixProcessHandle) -> ProcessStatus {
            for _ in 0..200 {
                if let Some(status) = handle.try_wait().await.unwrap() {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            panic!("process did not exit");
        }

        #[tokio::test]
        async fn test_spawn_with_piped_streams() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_process("sh", &sh("read line; echo \"got $line\"; echo oops >&2"), None, &HashMap::new())
                .await
                .unwrap();
            assert!(handle.get_pid().is_some());

            let pipes = handle.take_pipes();
            let mut stdin = pipes.stdin.unwrap();
            stdin.write_all(b"hello\n").await.unwrap();
            stdin.flush().await.unwrap();

            let mut out = BufReader::new(pipes.stdout.unwrap()).lines();
            assert_eq!(out.next_line().await.unwrap().unwrap(), "got hello");
            let mut err = BufReader::new(pipes.stderr.unwrap()).lines();
            assert_eq!(err.next_line().await.unwrap().unwrap(), "oops");

            assert_eq!(wait_exit(&mut handle).await, ProcessStatus::Exited { code: Some(0) });
        }

        #[tokio::test]
        async fn test_env_and_working_dir() {
            let manager = UnixProcessManager::new();
            let env = HashMap::from([("SERVER_NAME".to_string(), "lobby".to_string())]);
            let mut handle = manager
                .spawn_process("sh", &sh("echo \"$SERVER_NAME $(pwd)\""), Some("/"), &env)
                .await
                .unwrap();

            let mut out = BufReader::new(handle.take_pipes().stdout.unwrap()).lines();
            assert_eq!(out.next_line().await.unwrap().unwrap(), "lobby /");
        }

        #[tokio::test]
        async fn test_missing_executable() {
            let manager = UnixProcessManager::new();
            let err = manager
                .spawn_process("/nonexistent/java", &[], None, &HashMap::new())
                .await
                .err()
                .unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        }

        #[tokio::test]
        async fn test_sigterm_terminates() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_process("sleep", &["30".to_string()], None, &HashMap::new())
                .await
                .unwrap();

            assert_eq!(manager.terminate_gracefully(&mut handle).await, TerminationResult::Success);
            assert_eq!(wait_exit(&mut handle).await, ProcessStatus::Terminated);
        }

        #[tokio::test]
        async fn test_force_kill_ignoring_sigterm() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_process("sh", &sh("trap '' TERM; echo ready; while true; do sleep 1; done"), None, &HashMap::new())
                .await
                .unwrap();
            let mut out = BufReader::new(handle.take_pipes().stdout.unwrap()).lines();
            assert_eq!(out.next_line().await.unwrap().unwrap(), "ready");

            manager.terminate_gracefully(&mut handle).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(handle.try_wait().await.unwrap().is_none());

            assert_eq!(manager.force_kill(&mut handle).await, TerminationResult::Success);
            assert_eq!(wait_exit(&mut handle).await, ProcessStatus::Terminated);
        }

        #[tokio::test]
        async fn test_find_child_processes() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_process("sh", &sh("sleep 30 & echo started; wait"), None, &HashMap::new())
                .await
                .unwrap();
            let pid = handle.get_pid().unwrap();
            let mut out = BufReader::new(handle.take_pipes().stdout.unwrap()).lines();
            assert_eq!(out.next_line().await.unwrap().unwrap(), "started");

            let children = manager.find_child_processes(pid).await.unwrap();
            assert!(!children.is_empty());

            manager.force_kill(&mut handle).await;
            wait_exit(&mut handle).await;
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Stubs so the workspace still builds on other platforms
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;
