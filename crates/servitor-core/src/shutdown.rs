use crate::error::SupervisorError;
use crate::process::{ProcessManager, ProcessStatus, TerminationResult};
use crate::state::SupervisorState;
use crate::supervisor::{RunLink, Shared, Supervisor, wait_finished};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a graceful stop
#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    pub status: ProcessStatus,
    pub elapsed: Duration,
}

/// How [`Supervisor::stop_or_kill`] ended the process
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownOutcome {
    /// The process honored the stop command
    Graceful(StopReport),
    /// The stop timed out and the process was force-killed
    Killed,
}

type StopResult = Result<StopReport, SupervisorError>;

/// Shared view of one in-flight graceful stop
///
/// The wait runs on its own task; the ticket lets callers await it, poll it
/// or cancel it. Every clone observes the same outcome.
#[derive(Debug, Clone)]
pub struct StopTicket {
    outcome: watch::Receiver<Option<StopResult>>,
    cancel: CancellationToken,
}

impl StopTicket {
    fn new() -> (Self, watch::Sender<Option<StopResult>>) {
        let (tx, rx) = watch::channel(None);
        let ticket = Self {
            outcome: rx,
            cancel: CancellationToken::new(),
        };
        (ticket, tx)
    }

    /// Wait for the stop to resolve
    pub async fn wait(&self) -> StopResult {
        let mut outcome = self.outcome.clone();
        match outcome.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Err(SupervisorError::StopCancelled)),
            Err(_) => Err(SupervisorError::StopCancelled),
        }
    }

    /// The outcome if the stop already resolved
    pub fn try_outcome(&self) -> Option<StopResult> {
        self.outcome.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Stop waiting; the process is left alive in `Terminating`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

enum StopWait {
    Finished(ProcessStatus),
    TimedOut,
    Cancelled,
}

async fn wait_with_grace(
    finished: &mut watch::Receiver<Option<ProcessStatus>>,
    grace: Duration,
) -> Option<ProcessStatus> {
    tokio::time::timeout(grace, wait_finished(finished)).await.ok()
}

/// Bound a platform termination call so a hung call cannot pin the slot lock
async fn within_grace(
    grace: Duration,
    call: impl Future<Output = TerminationResult>,
) -> TerminationResult {
    tokio::time::timeout(grace, call).await.unwrap_or_else(|_| {
        warn!(?grace, "Termination call did not return in time");
        TerminationResult::Failed(format!("termination call hung for {grace:?}"))
    })
}

impl<M: ProcessManager> Shared<M> {
    /// Retire a stop that ended without an exit, moving `Stopping` to
    /// `Terminating`
    ///
    /// The ticket is released so a later `request_stop` starts a fresh wait.
    async fn escalate(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            return;
        }
        slot.stop = None;
        if slot.state == SupervisorState::Stopping {
            self.transition(&mut slot, SupervisorState::Terminating);
        }
    }
}

/// Graceful-stop protocol for one run
///
/// Sends the stop command, then waits for the run to be finalized, for the
/// deadline, or for cancellation, whichever comes first.
async fn run_stop<M: ProcessManager>(
    shared: Arc<Shared<M>>,
    link: RunLink,
    outcome: watch::Sender<Option<StopResult>>,
    cancel: CancellationToken,
    timeout: Duration,
    send_command: bool,
) {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut finished = link.finished.clone();
    let stop_command = shared.config.stop_command.as_str();

    let delivered = if send_command {
        let send = link.send(stop_command, shared.config.echo_commands);
        match tokio::time::timeout_at(deadline, send).await {
            Ok(Ok(())) => {
                info!(generation = link.generation, command = stop_command, "Sent stop command");
                true
            }
            Ok(Err(e)) => {
                warn!(
                    generation = link.generation,
                    error = %e,
                    "Could not deliver stop command, treating as timed out"
                );
                false
            }
            Err(_) => {
                warn!(generation = link.generation, "Stop command write exceeded the stop timeout");
                false
            }
        }
    } else {
        true
    };

    let wait = if delivered {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => StopWait::Cancelled,
            status = wait_finished(&mut finished) => StopWait::Finished(status),
            _ = tokio::time::sleep_until(deadline) => StopWait::TimedOut,
        }
    } else {
        StopWait::TimedOut
    };

    // The process may have exited right as the wait gave up
    let already_finished = *finished.borrow();
    let result = match (wait, already_finished) {
        (StopWait::Finished(status), _) | (_, Some(status)) => {
            info!(generation = link.generation, elapsed = ?started.elapsed(), "Graceful stop completed");
            Ok(StopReport {
                status,
                elapsed: started.elapsed(),
            })
        }
        (StopWait::TimedOut, None) => {
            warn!(generation = link.generation, ?timeout, "Process did not exit after stop command");
            shared.escalate(link.generation).await;
            Err(SupervisorError::GracefulStopTimedOut(timeout))
        }
        (StopWait::Cancelled, None) => {
            info!(generation = link.generation, "Graceful stop wait cancelled");
            shared.escalate(link.generation).await;
            Err(SupervisorError::StopCancelled)
        }
    };

    outcome.send_replace(Some(result));
}

impl<M: ProcessManager> Supervisor<M> {
    /// Begin a graceful stop and return a ticket for its outcome
    ///
    /// Returns immediately; the wait runs in the background. While a stop is
    /// already pending the existing ticket is returned. `timeout` defaults to
    /// the configured stop timeout.
    pub async fn request_stop(&self, timeout: Option<Duration>) -> Result<StopTicket, SupervisorError> {
        let shared = &self.shared;
        let timeout = timeout.unwrap_or_else(|| shared.config.stop_timeout());
        let mut slot = shared.slot.lock().await;

        if let Some(ticket) = slot.stop.as_ref() {
            debug!(state = %slot.state, "Joining pending stop");
            return Ok(ticket.clone());
        }

        let send_command = match slot.state {
            SupervisorState::Idle => return Err(SupervisorError::NotRunning),
            SupervisorState::Running => true,
            // Already being killed; only wait for the exit
            SupervisorState::Stopping | SupervisorState::Terminating => false,
        };
        let Some(run) = slot.run.as_ref() else {
            return Err(SupervisorError::NotRunning);
        };
        let link = run.link(slot.generation);

        if send_command {
            shared.transition(&mut slot, SupervisorState::Stopping);
        }
        let (ticket, outcome) = StopTicket::new();
        slot.stop = Some(ticket.clone());
        drop(slot);

        tokio::spawn(run_stop(
            shared.clone(),
            link,
            outcome,
            ticket.cancel.clone(),
            timeout,
            send_command,
        ));
        Ok(ticket)
    }

    /// Graceful stop, waiting for the outcome
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<StopReport, SupervisorError> {
        self.request_stop(timeout).await?.wait().await
    }

    /// Graceful stop, force-killing the process if it does not exit in time
    pub async fn stop_or_kill(&self, timeout: Option<Duration>) -> Result<ShutdownOutcome, SupervisorError> {
        match self.stop(timeout).await {
            Ok(report) => Ok(ShutdownOutcome::Graceful(report)),
            Err(SupervisorError::GracefulStopTimedOut(_) | SupervisorError::StopCancelled) => {
                self.force_kill().await?;
                Ok(ShutdownOutcome::Killed)
            }
            Err(e) => Err(e),
        }
    }

    /// Terminate the process without its cooperation
    ///
    /// Sends a termination request, waits the kill grace, escalates to an
    /// unconditional kill, and waits once more. The supervisor always ends up
    /// `Idle`, even when termination could not be confirmed. Calling this
    /// without a process is a no-op.
    pub async fn force_kill(&self) -> Result<(), SupervisorError> {
        let shared = &self.shared;
        let grace = shared.config.kill_grace();

        let (generation, mut finished, pending_stop) = {
            let mut slot = shared.slot.lock().await;
            let Some(run) = slot.run.as_mut() else {
                debug!("Force kill requested with no process");
                return Ok(());
            };
            let finished = run.finished.subscribe();
            let result =
                within_grace(grace, shared.manager.terminate_gracefully(&mut run.handle)).await;
            debug!(?result, "Requested process termination");

            if slot.state != SupervisorState::Terminating {
                shared.transition(&mut slot, SupervisorState::Terminating);
            }
            (slot.generation, finished, slot.stop.clone())
        };

        if let Some(stop) = pending_stop {
            stop.cancel();
        }

        if let Some(status) = wait_with_grace(&mut finished, grace).await {
            info!(generation, ?status, "Process terminated");
            return Ok(());
        }

        let kill = {
            let mut slot = shared.slot.lock().await;
            if slot.generation != generation {
                return Ok(());
            }
            match slot.run.as_mut() {
                Some(run) => within_grace(grace, shared.manager.force_kill(&mut run.handle)).await,
                None => return Ok(()),
            }
        };
        warn!(generation, result = ?kill, "Process ignored termination, killed it");

        if let Some(status) = wait_with_grace(&mut finished, grace).await {
            info!(generation, ?status, "Process killed");
            return Ok(());
        }

        let reason = match kill {
            TerminationResult::Failed(reason) => reason,
            TerminationResult::AccessDenied => "access denied".to_string(),
            _ => format!("process still present {grace:?} after kill"),
        };
        error!(generation, %reason, "Could not confirm termination, discarding process handle");

        if shared.finalize(generation, ProcessStatus::Unknown).await {
            Err(SupervisorError::ForceKillFailed(reason))
        } else {
            Ok(())
        }
    }
}
