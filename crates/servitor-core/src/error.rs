use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for every supervisor operation
///
/// OS-level failures are converted into one of these variants at the
/// supervisor boundary; raw platform errors never reach the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("A process is already running")]
    AlreadyRunning,

    #[error("No process is running")]
    NotRunning,

    #[error("Failed to write to process input: {0}")]
    WriteFailed(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Process did not exit within {0:?} after the stop command")]
    GracefulStopTimedOut(Duration),

    #[error("Stop wait cancelled")]
    StopCancelled,

    #[error("Could not confirm process termination: {0}")]
    ForceKillFailed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SupervisorError {
    /// Check if the supervisor can keep being used after this error
    ///
    /// Only a rejected configuration needs the caller to change its input
    /// before anything else can succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SupervisorError::Configuration(_))
    }

    /// Check if this error is a state precondition violation
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            SupervisorError::AlreadyRunning | SupervisorError::NotRunning
        )
    }
}
