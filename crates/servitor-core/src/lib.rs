//! Servitor Core - Platform-independent supervision of one interactive child process
//!
//! This crate provides the supervisor state machine, the console line pipeline,
//! the command writer and the traits that platform-specific crates implement
//! to spawn and terminate processes.

mod config;
mod console;
mod error;
mod launch;
mod observer;
mod process;
mod shutdown;
mod state;
mod supervisor;
mod writer;

#[cfg(test)]
mod fake;

pub use config::*;
pub use console::*;
pub use error::*;
pub use launch::*;
pub use observer::*;
pub use process::*;
pub use shutdown::{ShutdownOutcome, StopReport, StopTicket};
pub use state::SupervisorState;
pub use supervisor::Supervisor;
pub use writer::CommandWriter;
