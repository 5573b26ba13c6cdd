use crate::error::SupervisorError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for the supervisor and its shutdown protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// In-band command that asks the server to shut down
    #[serde(default = "default_stop_command")]
    pub stop_command: String,

    /// Default graceful-stop budget (in milliseconds)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Grace interval for each forced-termination step (in milliseconds)
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Upper bound for one write to the process input (in milliseconds)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How often the process is polled for exit (in milliseconds)
    #[serde(default = "default_exit_poll_interval_ms")]
    pub exit_poll_interval_ms: u64,

    /// How long output keeps draining after the process exited (in milliseconds)
    #[serde(default = "default_output_drain_ms")]
    pub output_drain_ms: u64,

    /// Publish accepted commands as `> text` console lines
    #[serde(default = "default_echo_commands")]
    pub echo_commands: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_command: default_stop_command(),
            stop_timeout_ms: default_stop_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            exit_poll_interval_ms: default_exit_poll_interval_ms(),
            output_drain_ms: default_output_drain_ms(),
            echo_commands: default_echo_commands(),
        }
    }
}

impl SupervisorConfig {
    /// Create a new SupervisorConfig with sensible defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.stop_command.trim().is_empty() {
            return Err(SupervisorError::Configuration(
                "stop_command cannot be empty".to_string(),
            ));
        }

        if self.stop_command.contains(['\n', '\r']) {
            return Err(SupervisorError::Configuration(
                "stop_command must be a single line".to_string(),
            ));
        }

        let durations = [
            ("stop_timeout_ms", self.stop_timeout_ms),
            ("kill_grace_ms", self.kill_grace_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("exit_poll_interval_ms", self.exit_poll_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(SupervisorError::Configuration(format!(
                "{name} must be greater than zero"
            )));
        }

        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

/// Fully resolved command line handed over by the artifact provisioner
#[derive(Default, Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct LaunchSpec {
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn builder() -> LaunchSpecBuilder {
        LaunchSpecBuilder::default()
    }
}

impl LaunchSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

// Default value functions for serde
fn default_stop_command() -> String {
    "stop".to_string()
}
fn default_stop_timeout_ms() -> u64 {
    30_000
}
fn default_kill_grace_ms() -> u64 {
    5_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_exit_poll_interval_ms() -> u64 {
    100
}
fn default_output_drain_ms() -> u64 {
    2_000
}
fn default_echo_commands() -> bool {
    true
}
