//! In-memory process manager for unit tests

use crate::config::SupervisorConfig;
use crate::console::ConsoleLine;
use crate::process::{
    ChildInput, ChildOutput, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessPipes, ProcessStatus, ProcessTermination, TerminationResult,
};
use crate::state::SupervisorState;
use crate::supervisor::Supervisor;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How the fake child reacts to the supervisor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    /// Echoes every line as `ECHO:<line>` and exits on `stop`
    Echo,
    /// Echoes, ignores `stop`, exits on a termination request
    IgnoreStop,
    /// Ignores `stop` and termination requests, dies on kill
    Stubborn,
    /// Never exits
    Unkillable,
    /// Echoes, then exits with code 1 after the delay
    CrashAfter(Duration),
    /// Acknowledges `stop` but only exits after the delay
    SlowStop(Duration),
    /// Closes its input right after starting, exits on a termination request
    CloseInput,
    /// Ignores `stop`; termination and kill calls never return
    HangsOnKill,
}

struct FakeProcess {
    status: Mutex<Option<ProcessStatus>>,
    exit_request: Mutex<Option<ProcessStatus>>,
    exit: CancellationToken,
}

impl FakeProcess {
    fn request_exit(&self, status: ProcessStatus) {
        let mut request = self.exit_request.lock().unwrap();
        if request.is_none() {
            *request = Some(status);
        }
        drop(request);
        self.exit.cancel();
    }

    fn status(&self) -> Option<ProcessStatus> {
        *self.status.lock().unwrap()
    }

    fn has_exited(&self) -> bool {
        self.status().is_some()
    }

    fn requested_status(&self) -> ProcessStatus {
        let request = *self.exit_request.lock().unwrap();
        request.unwrap_or(ProcessStatus::Terminated)
    }

    fn set_exited(&self, status: ProcessStatus) {
        *self.status.lock().unwrap() = Some(status);
    }
}

pub struct FakeHandle {
    pid: ProcessId,
    command: String,
    args: Vec<String>,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    process: Arc<FakeProcess>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        Some(self.pid)
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn get_args(&self) -> &[String] {
        &self.args
    }

    fn take_pipes(&mut self) -> ProcessPipes {
        ProcessPipes {
            stdin: self.stdin.take().map(|s| Box::new(s) as ChildInput),
            stdout: self.stdout.take().map(|s| Box::new(s) as ChildOutput),
            stderr: self.stderr.take().map(|s| Box::new(s) as ChildOutput),
        }
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        Ok(self.process.status())
    }

    async fn kill(&mut self) -> Result<()> {
        self.process.request_exit(ProcessStatus::Terminated);
        Ok(())
    }
}

pub struct FakeManager {
    behavior: Behavior,
    next_pid: AtomicU32,
    spawned: AtomicUsize,
    kills: AtomicUsize,
    stop_commands: Arc<AtomicUsize>,
    processes: Mutex<HashMap<ProcessId, Arc<FakeProcess>>>,
}

impl FakeManager {
    /// Spawning this command fails like a missing executable
    pub const MISSING_COMMAND: &'static str = "/nonexistent/server";

    pub fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            next_pid: AtomicU32::new(1000),
            spawned: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            stop_commands: Arc::new(AtomicUsize::new(0)),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn kills_issued(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn stop_commands_received(&self) -> usize {
        self.stop_commands.load(Ordering::SeqCst)
    }

    fn live_process(&self, handle: &dyn ProcessHandle) -> Option<Arc<FakeProcess>> {
        let pid = handle.get_pid()?;
        let process = self.processes.lock().unwrap().get(&pid).cloned()?;
        (!process.has_exited()).then_some(process)
    }
}

async fn run_child(
    behavior: Behavior,
    mut stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    process: Arc<FakeProcess>,
    stop_commands: Arc<AtomicUsize>,
) {
    if behavior == Behavior::CloseInput {
        // Swap in a reader whose writer is already gone
        stdin = tokio::io::duplex(1).0;
    }

    let _ = stdout.write_all(b"Starting fake server\n").await;
    let _ = stderr.write_all(b"Preparing spawn area\n").await;

    // Exit on a timer: (delay, last words, exit code)
    let mut scheduled: Option<(Pin<Box<tokio::time::Sleep>>, &str, i32)> = match behavior {
        Behavior::CrashAfter(delay) => Some((Box::pin(tokio::time::sleep(delay)), "Crashing", 1)),
        _ => None,
    };

    let mut lines = BufReader::new(stdin).lines();
    let mut input_open = true;
    let status = loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) if line == "stop" => {
                    stop_commands.fetch_add(1, Ordering::SeqCst);
                    match behavior {
                        Behavior::Echo | Behavior::CrashAfter(_) => {
                            let _ = stdout.write_all(b"Stopping the server\n").await;
                            break ProcessStatus::Exited { code: Some(0) };
                        }
                        Behavior::SlowStop(delay) => {
                            let _ = stdout.write_all(b"Saving worlds\n").await;
                            let timer = Box::pin(tokio::time::sleep(delay));
                            scheduled = Some((timer, "Stopping the server", 0));
                        }
                        _ => {}
                    }
                }
                Ok(Some(line)) => {
                    let _ = stdout.write_all(format!("ECHO:{line}\n").as_bytes()).await;
                }
                _ => input_open = false,
            },
            _ = process.exit.cancelled() => {
                break process.requested_status();
            }
            (message, code) = async {
                let (timer, message, code) = scheduled.as_mut().unwrap();
                timer.await;
                (*message, *code)
            }, if scheduled.is_some() => {
                let _ = stdout.write_all(format!("{message}\n").as_bytes()).await;
                break ProcessStatus::Exited { code: Some(code) };
            }
        }
    };

    // Exit is observable before the output closes
    process.set_exited(status);
    drop(stdout);
    drop(stderr);
}

#[async_trait]
impl ProcessLifecycle for FakeManager {
    type Handle = FakeHandle;

    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        _working_dir: Option<&str>,
        _env: &HashMap<String, String>,
    ) -> Result<Self::Handle, std::io::Error> {
        if command == Self::MISSING_COMMAND {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No such file or directory",
            ));
        }

        let pid = ProcessId(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let (stdin, child_stdin) = tokio::io::duplex(4096);
        let (child_stdout, stdout) = tokio::io::duplex(4096);
        let (child_stderr, stderr) = tokio::io::duplex(4096);
        let process = Arc::new(FakeProcess {
            status: Mutex::new(None),
            exit_request: Mutex::new(None),
            exit: CancellationToken::new(),
        });
        self.processes.lock().unwrap().insert(pid, process.clone());

        tokio::spawn(run_child(
            self.behavior,
            child_stdin,
            child_stdout,
            child_stderr,
            process.clone(),
            self.stop_commands.clone(),
        ));

        Ok(FakeHandle {
            pid,
            command: command.to_string(),
            args: args.to_vec(),
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            process,
        })
    }
}

#[async_trait]
impl ProcessTermination for FakeManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(process) = self.live_process(handle) else {
            return TerminationResult::ProcessNotFound;
        };
        match self.behavior {
            Behavior::Stubborn | Behavior::Unkillable => {}
            Behavior::HangsOnKill => std::future::pending().await,
            _ => process.request_exit(ProcessStatus::Terminated),
        }
        TerminationResult::Success
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(process) = self.live_process(handle) else {
            return TerminationResult::ProcessNotFound;
        };
        self.kills.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Unkillable => {}
            Behavior::HangsOnKill => std::future::pending().await,
            _ => process.request_exit(ProcessStatus::Terminated),
        }
        TerminationResult::Success
    }

    async fn find_child_processes(&self, _pid: ProcessId) -> Result<Vec<ProcessId>> {
        Ok(Vec::new())
    }
}

impl ProcessManager for FakeManager {
    fn new() -> Self {
        Self::with_behavior(Behavior::Echo)
    }

    fn platform_name(&self) -> &'static str {
        "fake"
    }
}

pub fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        stop_timeout_ms: 300,
        kill_grace_ms: 200,
        write_timeout_ms: 1000,
        exit_poll_interval_ms: 10,
        output_drain_ms: 200,
        ..SupervisorConfig::default()
    }
}

/// Receive lines until one matches `text` exactly
pub async fn wait_for_line(lines: &mut mpsc::UnboundedReceiver<ConsoleLine>, text: &str) -> ConsoleLine {
    let wait = async {
        while let Some(line) = lines.recv().await {
            if line.text == text {
                return line;
            }
        }
        panic!("output closed before {text:?}");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {text:?}"))
}

pub async fn wait_for_state<M: ProcessManager>(sup: &Supervisor<M>, state: SupervisorState) {
    let mut states = sup.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}
