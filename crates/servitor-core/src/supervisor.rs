use crate::config::{LaunchSpec, SupervisorConfig};
use crate::console::{ConsoleLine, LineOrigin, LineReader};
use crate::error::SupervisorError;
use crate::observer::{ObserverId, ObserverRegistry};
use crate::process::{
    ProcessHandle, ProcessId, ProcessInfo, ProcessManager, ProcessPipes, ProcessStatus,
};
use crate::shutdown::StopTicket;
use crate::state::SupervisorState;
use crate::writer::CommandWriter;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Supervises one interactive child process at a time
///
/// Every read or write of the state and the process handle goes through a
/// single async mutex. Console output is delivered to observers from a
/// dispatcher task, never while that mutex is held.
///
/// Cloning is cheap; all clones drive the same process.
pub struct Supervisor<M: ProcessManager> {
    pub(crate) shared: Arc<Shared<M>>,
}

impl<M: ProcessManager> Clone for Supervisor<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) struct Shared<M: ProcessManager> {
    pub(crate) manager: M,
    pub(crate) config: SupervisorConfig,
    pub(crate) slot: Mutex<Slot<M::Handle>>,
    state_tx: watch::Sender<SupervisorState>,
    observers: Arc<ObserverRegistry>,
    last_launch: std::sync::Mutex<Option<LaunchSpec>>,
    restarts: AtomicU32,
}

pub(crate) struct Slot<H> {
    pub(crate) state: SupervisorState,
    pub(crate) generation: u64,
    pub(crate) run: Option<Run<H>>,
    pub(crate) stop: Option<StopTicket>,
}

/// Everything owned by one spawned process instance
pub(crate) struct Run<H> {
    pub(crate) handle: H,
    started_at: Instant,
    writer: Arc<CommandWriter>,
    lines: mpsc::UnboundedSender<ConsoleLine>,
    pub(crate) finished: watch::Sender<Option<ProcessStatus>>,
}

impl<H> Run<H> {
    pub(crate) fn link(&self, generation: u64) -> RunLink {
        RunLink {
            generation,
            writer: self.writer.clone(),
            lines: self.lines.clone(),
            finished: self.finished.subscribe(),
        }
    }
}

/// The parts of a run that may be used without holding the slot lock
#[derive(Clone)]
pub(crate) struct RunLink {
    pub(crate) generation: u64,
    writer: Arc<CommandWriter>,
    lines: mpsc::UnboundedSender<ConsoleLine>,
    pub(crate) finished: watch::Receiver<Option<ProcessStatus>>,
}

impl RunLink {
    /// Write one command, echoing it as `> command` ahead of any reply
    pub(crate) async fn send(&self, command: &str, echo: bool) -> Result<(), SupervisorError> {
        self.writer
            .write_line_with(command, || {
                if echo {
                    let _ = self
                        .lines
                        .send(ConsoleLine::new(format!("> {command}"), LineOrigin::Command));
                }
            })
            .await
    }
}

enum ExitPoll {
    Alive,
    Exited(ProcessStatus),
    Gone,
}

/// Wait until the run is finalized, returning its final status
pub(crate) async fn wait_finished(
    finished: &mut watch::Receiver<Option<ProcessStatus>>,
) -> ProcessStatus {
    match finished.wait_for(Option::is_some).await {
        Ok(status) => (*status).unwrap_or(ProcessStatus::Unknown),
        // Sender dropped with the run
        Err(_) => ProcessStatus::Unknown,
    }
}

impl<M: ProcessManager> Shared<M> {
    pub(crate) fn transition(&self, slot: &mut Slot<M::Handle>, next: SupervisorState) -> bool {
        if !slot.state.can_transition_to(next) {
            warn!(from = %slot.state, to = %next, "Rejected state transition");
            return false;
        }
        info!(
            from = %slot.state,
            to = %next,
            generation = slot.generation,
            "Supervisor state changed"
        );
        slot.state = next;
        self.state_tx.send_replace(next);
        true
    }

    async fn poll_exit(&self, generation: u64) -> ExitPoll {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            return ExitPoll::Gone;
        }
        let Some(run) = slot.run.as_mut() else {
            return ExitPoll::Gone;
        };

        match run.handle.try_wait().await {
            Ok(Some(status)) => ExitPoll::Exited(status),
            Ok(None) => ExitPoll::Alive,
            Err(e) => {
                warn!(generation, error = %e, "Could not query process status, assuming exit");
                ExitPoll::Exited(ProcessStatus::Unknown)
            }
        }
    }

    /// Clear the handle and return to `Idle`
    ///
    /// Every exit path ends here. Returns false when the run was already
    /// finalized by someone else.
    pub(crate) async fn finalize(&self, generation: u64, status: ProcessStatus) -> bool {
        let run = {
            let mut slot = self.slot.lock().await;
            if slot.generation != generation {
                return false;
            }
            let Some(run) = slot.run.take() else {
                return false;
            };
            slot.stop = None;
            self.transition(&mut slot, SupervisorState::Idle);
            run
        };

        run.writer.close().await;
        run.finished.send_replace(Some(status));
        info!(
            generation,
            status = ?status,
            uptime = ?run.started_at.elapsed(),
            "Server process finished"
        );
        true
    }
}

impl<M: ProcessManager> Supervisor<M> {
    /// Create a supervisor around a platform process manager
    pub fn new(manager: M, config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        info!(
            platform = manager.platform_name(),
            stop_command = %config.stop_command,
            "Created process supervisor"
        );

        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                config,
                slot: Mutex::new(Slot {
                    state: SupervisorState::Idle,
                    generation: 0,
                    run: None,
                    stop: None,
                }),
                state_tx,
                observers: Arc::new(ObserverRegistry::new()),
                last_launch: std::sync::Mutex::new(None),
                restarts: AtomicU32::new(0),
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// The platform process manager backing this supervisor
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Spawn the process and start streaming its output
    ///
    /// Returns as soon as the process is spawned; output arrives at the
    /// observers asynchronously.
    pub async fn start(&self, launch: &LaunchSpec) -> Result<Option<ProcessId>, SupervisorError> {
        let shared = &self.shared;
        let mut slot = shared.slot.lock().await;
        if slot.state != SupervisorState::Idle {
            warn!(state = %slot.state, "Start requested while a process is active");
            return Err(SupervisorError::AlreadyRunning);
        }

        let working_dir = launch
            .working_directory
            .as_ref()
            .map(|dir| dir.to_string_lossy().into_owned());
        let mut handle = shared
            .manager
            .spawn_process(
                &launch.command,
                &launch.args,
                working_dir.as_deref(),
                &launch.env,
            )
            .await
            .map_err(|e| {
                warn!(command = %launch.command, error = %e, "Failed to spawn server process");
                SupervisorError::SpawnFailed(format!("{}: {e}", launch.command))
            })?;

        let ProcessPipes {
            stdin,
            stdout,
            stderr,
        } = handle.take_pipes();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            if let Err(e) = handle.kill().await {
                warn!(error = %e, "Failed to kill process without captured streams");
            }
            return Err(SupervisorError::SpawnFailed(format!(
                "{}: standard streams were not captured",
                launch.command
            )));
        };

        let pid = handle.get_pid();
        slot.generation += 1;
        let generation = slot.generation;

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(lines_rx, shared.observers.clone()));
        let reader = LineReader::new(stdout, stderr).spawn(lines_tx.clone());
        let (finished, _) = watch::channel(None);

        slot.run = Some(Run {
            handle,
            started_at: Instant::now(),
            writer: Arc::new(CommandWriter::new(stdin, shared.config.write_timeout())),
            lines: lines_tx,
            finished,
        });
        slot.stop = None;
        shared.transition(&mut slot, SupervisorState::Running);
        drop(slot);

        tokio::spawn(monitor(shared.clone(), generation, reader));
        *shared
            .last_launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(launch.clone());

        info!(
            pid = ?pid.map(|p| p.0),
            command = %launch.command,
            args = ?launch.args,
            generation,
            "Started server process"
        );
        Ok(pid)
    }

    /// Forward one command line to the process input
    pub async fn submit_command(&self, text: &str) -> Result<(), SupervisorError> {
        let command = text.trim();
        if command.is_empty() {
            return Err(SupervisorError::InvalidCommand(
                "command is empty".to_string(),
            ));
        }
        if command.contains(['\n', '\r']) {
            return Err(SupervisorError::InvalidCommand(
                "command must be a single line".to_string(),
            ));
        }

        let link = {
            let slot = self.shared.slot.lock().await;
            match slot.run.as_ref() {
                Some(run) if slot.state.accepts_commands() => run.link(slot.generation),
                _ => return Err(SupervisorError::NotRunning),
            }
        };

        link.send(command, self.shared.config.echo_commands).await?;
        debug!(generation = link.generation, command, "Submitted command");
        Ok(())
    }

    /// Stop (or kill) the current process if any, then start the last launch again
    pub async fn restart(&self, timeout: Option<Duration>) -> Result<Option<ProcessId>, SupervisorError> {
        let launch = self
            .shared
            .last_launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SupervisorError::NotRunning)?;

        if self.state().has_process() {
            match self.stop_or_kill(timeout).await {
                Ok(outcome) => debug!(?outcome, "Stopped process for restart"),
                Err(SupervisorError::NotRunning) => {}
                Err(e) => return Err(e),
            }
        }

        let count = self.shared.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(restart_count = count, "Restarting server process");
        self.start(&launch).await
    }

    pub fn restart_count(&self) -> u32 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// Register a callback invoked once per console line
    pub fn on_output_line<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ConsoleLine) + Send + Sync + 'static,
    {
        self.shared.observers.register(observer)
    }

    pub fn remove_output_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.unregister(id)
    }

    /// Receive console lines through a channel instead of a callback
    pub fn subscribe_output(&self) -> mpsc::UnboundedReceiver<ConsoleLine> {
        self.shared.observers.subscribe().1
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.state().has_process()
    }

    pub async fn pid(&self) -> Option<ProcessId> {
        let slot = self.shared.slot.lock().await;
        slot.run.as_ref().and_then(|run| run.handle.get_pid())
    }

    pub async fn process_info(&self) -> Option<ProcessInfo> {
        let slot = self.shared.slot.lock().await;
        slot.run.as_ref().map(|run| ProcessInfo {
            pid: run.handle.get_pid(),
            command: run.handle.get_command().to_string(),
            args: run.handle.get_args().to_vec(),
            uptime: run.started_at.elapsed(),
        })
    }
}

async fn dispatch(mut lines: mpsc::UnboundedReceiver<ConsoleLine>, observers: Arc<ObserverRegistry>) {
    while let Some(line) = lines.recv().await {
        observers.notify(&line);
    }
}

/// Watches one run until the process exits, then finalizes it
///
/// Exit is noticed either when the output closes or on the periodic poll,
/// and always confirmed by the platform's wait call.
async fn monitor<M: ProcessManager>(shared: Arc<Shared<M>>, generation: u64, mut reader: JoinHandle<()>) {
    let poll_interval = shared.config.exit_poll_interval();
    let mut output_closed = false;

    let status = loop {
        tokio::select! {
            _ = &mut reader, if !output_closed => {
                output_closed = true;
                debug!(generation, "Process output closed, confirming exit");
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match shared.poll_exit(generation).await {
            ExitPoll::Alive => continue,
            ExitPoll::Exited(status) => break status,
            ExitPoll::Gone => {
                reader.abort();
                return;
            }
        }
    };

    if !output_closed
        && tokio::time::timeout(shared.config.output_drain(), &mut reader)
            .await
            .is_err()
    {
        debug!(generation, "Output still open after exit, abandoning reader");
        reader.abort();
    }

    if shared.finalize(generation, status).await {
        debug!(generation, "Monitor finalized run");
    }
}
