//! Supervise one interactive server process: stream its console, feed it
//! commands, and shut it down with a stop command that escalates to a kill.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use servitor::{JavaServerLaunch, SupervisorConfig};
//!
//! let supervisor = servitor::create_supervisor(SupervisorConfig::default())?;
//! supervisor.on_output_line(|line| println!("{line}"));
//!
//! let launch = JavaServerLaunch::new("/srv/minecraft/server.jar").into_launch_spec()?;
//! supervisor.start(&launch).await?;
//! supervisor.submit_command("say hello").await?;
//! supervisor.stop_or_kill(None).await?;
//! # Ok(())
//! # }
//! ```

mod factory;
mod logging;

pub use factory::PlatformProcessManagerFactory;
pub use logging::init_tracing;
pub use servitor_core::*;

/// Supervisor backed by the current platform's process manager
pub type ServerSupervisor = Supervisor<<PlatformProcessManagerFactory as ProcessManagerFactory>::Manager>;

/// Create a supervisor for the current platform
pub fn create_supervisor(config: SupervisorConfig) -> Result<ServerSupervisor, SupervisorError> {
    tracing::debug!(
        platform = PlatformProcessManagerFactory::platform_name(),
        "Creating platform process manager"
    );
    Supervisor::new(PlatformProcessManagerFactory::create_process_manager(), config)
}
