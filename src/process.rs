//! Launching, probing and signalling server processes.
//!
//! Servers are started through `sh -c` in their own process group with every
//! standard stream detached, so they keep running after the devrack
//! invocation that launched them has exited. Later invocations only know a
//! server by its pid.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{DevError, Result};
use crate::events::ProcessSignal;

/// Process operations the lifecycle depends on.
pub trait Supervisor: Send + Sync {
    /// Whether `pid` refers to a live process. Any query failure reads as `false`.
    fn is_alive(&self, pid: u32) -> bool;

    /// Launches `command` through a shell, detached, and returns its pid.
    fn spawn(&self, command: &str, cwd: &Path) -> Result<u32>;

    /// Best-effort signal to the process and its group; failures are ignored.
    fn terminate(&self, pid: u32, signal: ProcessSignal);
}

/// [`Supervisor`] talking to the operating system.
#[derive(Debug, Default)]
pub struct OsSupervisor {
    // Children launched by this invocation. Until reaped they would still
    // answer a liveness probe as zombies, so they are checked with `try_wait`.
    children: Mutex<HashMap<u32, Child>>,
}

impl OsSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn own_child_alive(&self, pid: u32) -> Option<bool> {
        let mut children = self.children.lock().ok()?;
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(None) => Some(true),
            Ok(Some(status)) => {
                debug!(pid, ?status, "child exited");
                children.remove(&pid);
                Some(false)
            }
            Err(_) => Some(false),
        }
    }
}

impl Supervisor for OsSupervisor {
    fn is_alive(&self, pid: u32) -> bool {
        if let Some(alive) = self.own_child_alive(pid) {
            return alive;
        }
        os_process_exists(pid)
    }

    fn spawn(&self, command: &str, cwd: &Path) -> Result<u32> {
        let mut shell = shell_command(command);
        shell
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        #[cfg(unix)]
        shell.process_group(0);

        let child = shell.spawn().map_err(|source| DevError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(DevError::Spawn {
                command: command.to_string(),
                source: std::io::Error::other("process exited before its pid was known"),
            });
        };
        debug!(pid, command, "spawned");
        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, child);
        }
        Ok(pid)
    }

    fn terminate(&self, pid: u32, signal: ProcessSignal) {
        debug!(pid, ?signal, "signalling");
        send_os_signal(pid, signal);
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}

// pid 0 and values beyond pid_t would address our own group or wrap around.
#[cfg(unix)]
fn checked_pid(pid: u32) -> Option<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => Some(pid),
        _ => None,
    }
}

#[cfg(unix)]
fn os_process_exists(pid: u32) -> bool {
    let Some(pid) = checked_pid(pid) else {
        return false;
    };
    // Signal 0 performs the existence and permission checks without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn os_process_exists(pid: u32) -> bool {
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output();
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    let Some(pid) = checked_pid(pid) else {
        warn!(pid, "refusing to signal invalid pid");
        return;
    };
    let sig = match signal {
        ProcessSignal::SigInt => libc::SIGINT,
        ProcessSignal::SigTerm => libc::SIGTERM,
    };
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, _signal: ProcessSignal) {
    // No POSIX signals here; taskkill without /F asks the process tree to close.
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/PID", &pid.to_string()])
        .output();
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_until_dead(supervisor: &OsSupervisor, pid: u32) -> bool {
        for _ in 0..50 {
            if !supervisor.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn current_process_is_alive() {
        let supervisor = OsSupervisor::new();
        assert!(supervisor.is_alive(std::process::id()));
    }

    #[test]
    fn invalid_pids_are_not_alive() {
        let supervisor = OsSupervisor::new();
        assert!(!supervisor.is_alive(0));
        assert!(!supervisor.is_alive(u32::MAX));
        // Above the default pid_max on Linux and macOS.
        assert!(!supervisor.is_alive(4_194_304 + 17));
    }

    #[tokio::test]
    async fn spawns_detached_and_terminates_group() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = OsSupervisor::new();
        let pid = supervisor
            .spawn("sleep 30 > sleep.log 2>&1", dir.path())
            .unwrap();
        assert!(supervisor.is_alive(pid));
        assert!(dir.path().join("sleep.log").exists());

        supervisor.terminate(pid, ProcessSignal::SigTerm);
        assert!(wait_until_dead(&supervisor, pid).await);
    }

    #[tokio::test]
    async fn exited_child_is_not_alive() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = OsSupervisor::new();
        let pid = supervisor.spawn("exit 3", dir.path()).unwrap();
        assert!(wait_until_dead(&supervisor, pid).await);
    }

    #[tokio::test]
    async fn terminating_dead_process_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = OsSupervisor::new();
        let pid = supervisor.spawn("true", dir.path()).unwrap();
        assert!(wait_until_dead(&supervisor, pid).await);
        supervisor.terminate(pid, ProcessSignal::SigTerm);
        supervisor.terminate(0, ProcessSignal::SigTerm);
    }

    #[tokio::test]
    async fn missing_working_directory_fails_spawn() {
        let supervisor = OsSupervisor::new();
        let result = supervisor.spawn("true", Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(DevError::Spawn { .. })));
    }
}
