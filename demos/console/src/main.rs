//! Minimal console for a supervised server.
//!
//! ```text
//! console path/to/server.jar [java-home]
//! console -- <command> [args...]
//! ```
//!
//! Lines typed on stdin are forwarded as commands. Ctrl-C stops the server,
//! killing it if it ignores the stop command. Set `SERVITOR_CONFIG` to a JSON
//! file to override the supervisor settings.

use anyhow::{Context, bail};
use servitor::{JavaServerLaunch, LaunchSpec, SupervisorConfig, SupervisorError, SupervisorState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn load_config() -> anyhow::Result<SupervisorConfig> {
    let Ok(path) = std::env::var("SERVITOR_CONFIG") else {
        return Ok(SupervisorConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config: SupervisorConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    Ok(config)
}

fn launch_from_args() -> anyhow::Result<LaunchSpec> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [sep, command, rest @ ..] if sep == "--" => Ok(LaunchSpec::builder()
            .command(command.as_str())
            .args(rest)
            .build()?),
        [jar] => Ok(JavaServerLaunch::new(jar).into_launch_spec()?),
        [jar, java] => Ok(JavaServerLaunch::new(jar).java(java).into_launch_spec()?),
        _ => bail!("usage: console <server.jar> [java-home] | console -- <command> [args...]"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    servitor::init_tracing("info", false)?;

    let config = load_config()?;
    let launch = launch_from_args()?;
    let supervisor = servitor::create_supervisor(config)?;

    supervisor.on_output_line(|line| println!("{line}"));
    let mut states = supervisor.subscribe_state();
    supervisor.start(&launch).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match supervisor.submit_command(&line).await {
                    Ok(()) => {}
                    Err(SupervisorError::NotRunning) => warn!("Server is not accepting commands"),
                    Err(e) => warn!(error = %e, "Command rejected"),
                },
                None => {
                    info!("Input closed, stopping server");
                    break;
                }
            },
            changed = states.wait_for(|s| *s == SupervisorState::Idle) => {
                changed?;
                info!("Server exited");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping server");
                break;
            }
        }
    }

    if supervisor.is_alive() {
        let outcome = supervisor.stop_or_kill(None).await?;
        info!(?outcome, "Server shut down");
    }
    Ok(())
}
