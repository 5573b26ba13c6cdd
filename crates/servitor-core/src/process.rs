use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process exited on its own; `code` is absent when the platform reports none
    Exited { code: Option<i32> },
    /// Process was terminated by a signal (Unix) or forcibly terminated (Windows)
    Terminated,
    /// Process is gone but its status could not be observed
    Unknown,
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Termination was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Snapshot of the supervised process for presenters
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Option<ProcessId>,
    pub command: String,
    pub args: Vec<String>,
    pub uptime: Duration,
}

/// Writable end of the child's standard input
pub type ChildInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable end of one of the child's output streams
pub type ChildOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Standard streams of a freshly spawned child
///
/// Each stream can be taken exactly once; the supervisor takes all of them
/// right after spawning.
#[derive(Default)]
pub struct ProcessPipes {
    pub stdin: Option<ChildInput>,
    pub stdout: Option<ChildOutput>,
    pub stderr: Option<ChildOutput>,
}

/// Trait representing a handle to a spawned process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if the platform no longer reports one)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Get the arguments passed to this process
    fn get_args(&self) -> &[String];

    /// Take ownership of the child's standard streams
    fn take_pipes(&mut self) -> ProcessPipes;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>>;

    /// Kill the process (platform-specific implementation)
    async fn kill(&mut self) -> Result<()>;
}

/// Core trait for spawning processes
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle + 'static;

    /// Spawn a new process with all three standard streams piped
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle, std::io::Error>;
}

/// Trait for non-cooperative process termination
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask a process to terminate (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Unconditionally kill a process and its descendants (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all descendants of a given process, deepest first
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;
}

/// Process manager combining lifecycle and termination for one platform
pub trait ProcessManager: ProcessLifecycle + ProcessTermination + 'static {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;

    /// Get the platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
