//! Process liveness probe and termination escalation
//!
//! The probe never errors for expected conditions: a missing or stale pid
//! reads as "not running", and every termination failure collapses into
//! `TerminationOutcome::Failed`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of a graceful-close-then-force-kill escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Process exited within the close timeout (or was already gone).
    Exited,
    /// Process had to be force-killed and is gone.
    Killed,
    /// Process is still alive after the full escalation.
    Failed,
}

/// Seam between the supervision logic and the OS process table.
///
/// Production code uses [`SystemProbe`]; tests substitute a mock.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// True iff a process with this pid currently exists.
    fn is_running(&self, pid: u32) -> bool;

    /// Best-effort process name; empty string when the pid cannot be resolved.
    fn name_of(&self, pid: u32) -> String;

    /// Ask the process to close, wait up to `close_timeout`, then force-kill
    /// and wait up to `kill_timeout`.
    async fn terminate_gracefully(
        &self,
        pid: u32,
        close_timeout: Duration,
        kill_timeout: Duration,
    ) -> TerminationOutcome;
}

/// Probe backed by real OS process queries.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }

    /// Poll until the process is gone or the timeout elapses.
    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(unix)]
mod sys {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    pub(super) fn alive(pid: u32) -> bool {
        // Signal 0 probes existence. EPERM means the process exists but is
        // owned by someone else, which still counts as alive.
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub(super) fn send(pid: u32, signal: Signal) -> Result<(), Errno> {
        kill(Pid::from_raw(pid as i32), signal)
    }

    /// A zombie has exited; only its parent's reap is pending. `kill(pid, 0)`
    /// still succeeds for it, so the process table entry must be inspected.
    #[cfg(target_os = "linux")]
    pub(super) fn is_zombie(pid: u32) -> bool {
        let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(s) => s,
            Err(_) => return false,
        };
        // The state field follows the parenthesized comm, which may itself
        // contain parentheses; split on the last one.
        match stat.rfind(')') {
            Some(idx) => stat[idx + 1..].trim_start().starts_with('Z'),
            None => false,
        }
    }
}

#[async_trait]
impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_running(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        if !sys::alive(pid) {
            return false;
        }
        // An exited-but-unreaped child still answers signal 0; it must not
        // count as running or escalation would retry a process that is
        // already gone.
        #[cfg(target_os = "linux")]
        {
            if sys::is_zombie(pid) {
                return false;
            }
        }
        true
    }

    #[cfg(not(unix))]
    fn is_running(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    fn name_of(&self, pid: u32) -> String {
        std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    #[cfg(not(target_os = "linux"))]
    fn name_of(&self, _pid: u32) -> String {
        String::new()
    }

    #[cfg(unix)]
    async fn terminate_gracefully(
        &self,
        pid: u32,
        close_timeout: Duration,
        kill_timeout: Duration,
    ) -> TerminationOutcome {
        use nix::errno::Errno;
        use nix::sys::signal::Signal;

        if !self.is_running(pid) {
            return TerminationOutcome::Exited;
        }

        // SIGTERM is the "ask nicely" step; a process that ignores it falls
        // through to SIGKILL below.
        match sys::send(pid, Signal::SIGTERM) {
            Ok(()) => {
                if self.wait_for_exit(pid, close_timeout).await {
                    debug!(pid, "process exited after SIGTERM");
                    return TerminationOutcome::Exited;
                }
            }
            Err(Errno::ESRCH) => return TerminationOutcome::Exited,
            Err(e) => {
                debug!(pid, error = %e, "SIGTERM failed, escalating to SIGKILL");
            }
        }

        match sys::send(pid, Signal::SIGKILL) {
            Ok(()) => {
                if self.wait_for_exit(pid, kill_timeout).await {
                    debug!(pid, "process gone after SIGKILL");
                    TerminationOutcome::Killed
                } else {
                    warn!(pid, "process still alive after SIGKILL");
                    TerminationOutcome::Failed
                }
            }
            Err(Errno::ESRCH) => TerminationOutcome::Killed,
            Err(e) => {
                warn!(pid, error = %e, "failed to send SIGKILL");
                TerminationOutcome::Failed
            }
        }
    }

    #[cfg(not(unix))]
    async fn terminate_gracefully(
        &self,
        _pid: u32,
        _close_timeout: Duration,
        _kill_timeout: Duration,
    ) -> TerminationOutcome {
        TerminationOutcome::Failed
    }
}
