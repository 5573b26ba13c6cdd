use std::fmt;

/// Lifecycle state of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No process
    #[default]
    Idle,
    /// Process alive, I/O active
    Running,
    /// Cooperative stop issued, awaiting exit or timeout
    Stopping,
    /// Forced termination pending or in progress
    Terminating,
}

impl SupervisorState {
    /// Whether the transition table allows `self -> next`
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;

        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Stopping)
                | (Running, Terminating)
                | (Stopping, Terminating)
                | (Running | Stopping | Terminating, Idle)
        )
    }

    /// A process handle exists in every state but `Idle`
    pub fn has_process(self) -> bool {
        self != SupervisorState::Idle
    }

    pub fn accepts_commands(self) -> bool {
        self == SupervisorState::Running
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Terminating => "terminating",
        };
        f.write_str(name)
    }
}
