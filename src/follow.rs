//! Attaching a log viewer to a running server.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{DevError, Result};
use crate::events::ProcessSignal;
use crate::process::Supervisor;

pub const SERVER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Why following a log stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowExit {
    /// The user interrupted devrack; the server keeps running.
    Interrupted(ProcessSignal),
    /// The viewer terminated on its own.
    ViewerExited,
    /// The followed server died.
    ServerExited,
}

/// Runs `viewer` on `log_file` in the foreground until it exits, the user
/// interrupts, or the server behind `pid` dies.
pub async fn follow_logs(
    viewer: &str,
    log_file: &Path,
    pid: u32,
    supervisor: Arc<dyn Supervisor>,
    poll_interval: Duration,
) -> Result<FollowExit> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    let mut words = shell_words::split(viewer)
        .map_err(|err| DevError::Config(format!("invalid log viewer `{}`: {}", viewer, err)))?;
    if words.is_empty() {
        return Err(DevError::Config("log viewer command is empty".into()));
    }
    let program = words.remove(0);
    let mut child = Command::new(&program)
        .args(&words)
        .arg(log_file)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DevError::Spawn {
            command: viewer.to_string(),
            source,
        })?;
    debug!(viewer, log = %log_file.display(), "following");

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let exit = loop {
        tokio::select! {
            signal = shutdown_signal() => break FollowExit::Interrupted(signal),
            status = child.wait() => {
                debug!(?status, "log viewer exited");
                break FollowExit::ViewerExited;
            }
            _ = ticker.tick() => {
                if !supervisor.is_alive(pid) {
                    break FollowExit::ServerExited;
                }
            }
        }
    };

    if exit != FollowExit::ViewerExited {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    Ok(exit)
}

#[cfg(unix)]
async fn shutdown_signal() -> ProcessSignal {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return ProcessSignal::SigInt;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ProcessSignal::SigInt,
        _ = sigterm.recv() => ProcessSignal::SigTerm,
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> ProcessSignal {
    let _ = tokio::signal::ctrl_c().await;
    ProcessSignal::SigInt
}
