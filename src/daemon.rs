//! Background daemon lifecycle: discovery, launch, and shutdown
//!
//! The daemon advertises itself through a pid file in the state directory.
//! Discovery checks that the recorded pid still exists; a stale file is
//! cleaned up on the next launch or terminate.

use crate::config::{SupervisorConfig, STATE_DIR_ENV};
use crate::error::{Result, SupervisorError};
use crate::probe::{ProcessProbe, SystemProbe, TerminationOutcome};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Write this process's advertised pid. Used by the daemon itself on startup.
pub fn publish_pid(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("pid.tmp");
    fs::write(&tmp, format!("{pid}\n"))?;
    fs::rename(&tmp, path)
}

/// Remove the pid file, but only if it still names `pid`. A daemon shutting
/// down must not clobber the file of a newer daemon that replaced it.
pub fn clear_pid(path: &Path, pid: u32) {
    if read_pid(path) == Some(pid) {
        if let Err(e) = fs::remove_file(path) {
            debug!(path = %path.display(), error = %e, "failed to remove pid file");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    let pid: u32 = text.trim().parse().ok()?;
    (pid != 0).then_some(pid)
}

/// Launches and discovers the background monitor daemon.
pub struct DaemonLauncher {
    pidfile: PathBuf,
    probe: Arc<dyn ProcessProbe>,
    program: PathBuf,
    // Handle to a daemon we spawned ourselves; kept so the child can be
    // reaped once it exits instead of lingering as a zombie in our table.
    spawned: Option<Child>,
}

impl DaemonLauncher {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self::with_probe(config, Arc::new(SystemProbe::new()))
    }

    pub fn with_probe(config: &SupervisorConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("orphand"));
        Self {
            pidfile: config.daemon_pidfile(),
            probe,
            program,
            spawned: None,
        }
    }

    /// Override the binary to launch. Tests point this at the built binary
    /// because their own `current_exe` is the test harness.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Reap a spawned daemon that has since exited.
    fn reap_spawned(&mut self) {
        if let Some(child) = self.spawned.as_mut() {
            if matches!(child.try_wait(), Ok(Some(_)) | Err(_)) {
                self.spawned = None;
            }
        }
    }

    /// The daemon pid if the pid file names a live process.
    ///
    /// A recycled pid makes this report a stranger as our daemon. The window
    /// is small (the file is removed on clean shutdown) and the failure mode
    /// is a skipped launch, not a wrong kill.
    pub fn discover(&mut self) -> Option<u32> {
        self.reap_spawned();
        let pid = read_pid(&self.pidfile)?;
        self.probe.is_running(pid).then_some(pid)
    }

    pub fn is_running(&mut self) -> bool {
        self.discover().is_some()
    }

    /// Make sure a daemon is running. Returns true if one already was.
    pub fn launch(&mut self, config: &SupervisorConfig) -> Result<bool> {
        if let Some(pid) = self.discover() {
            debug!(pid, "daemon already running");
            return Ok(true);
        }

        let mut cmd = Command::new(&self.program);
        cmd.arg("monitor")
            .arg("--headless")
            .arg("--interval")
            .arg(config.check_interval.as_secs().max(1).to_string())
            .env(STATE_DIR_ENV, &config.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(idle) = config.exit_after_idle {
            cmd.arg("--exit-after-idle").arg(idle.as_secs().to_string());
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach from our process group so terminal signals do not reach it.
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(SupervisorError::Launch)?;
        let pid = child.id();
        self.spawned = Some(child);
        publish_pid(&self.pidfile, pid).map_err(SupervisorError::Persistence)?;
        info!(pid, program = %self.program.display(), "daemon launched");
        Ok(false)
    }

    /// Stop the daemon if one is running. Returns false only when a live
    /// daemon survived the full termination escalation.
    pub async fn terminate(&mut self) -> Result<bool> {
        let pid = match self.discover() {
            Some(pid) => pid,
            None => {
                // Nothing alive; drop any stale file.
                if self.pidfile.exists() {
                    let _ = fs::remove_file(&self.pidfile);
                }
                return Ok(true);
            }
        };

        info!(pid, "terminating daemon");
        let outcome = self
            .probe
            .terminate_gracefully(
                pid,
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(5),
            )
            .await;
        match outcome {
            TerminationOutcome::Failed => {
                warn!(pid, "daemon survived termination");
                Ok(false)
            }
            _ => {
                // If that was our own child, collect it so no zombie remains.
                if self.spawned.as_ref().map(|c| c.id()) == Some(pid) {
                    if let Some(mut child) = self.spawned.take() {
                        let _ = child.wait();
                    }
                }
                let _ = fs::remove_file(&self.pidfile);
                Ok(true)
            }
        }
    }
}
