//! Supervisor configuration and state directory layout

use crate::engine::EngineConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "ORPHAND_STATE_DIR";

/// Everything the coordinator and daemon need to agree on: where state
/// lives and how aggressively pairs are checked and terminated.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory holding the pair registry, leader lock, and daemon pid file.
    pub state_dir: PathBuf,
    pub check_interval: Duration,
    pub close_timeout: Duration,
    pub kill_timeout: Duration,
    pub exit_after_idle: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            check_interval: Duration::from_secs(3),
            close_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            exit_after_idle: None,
        }
    }
}

fn default_state_dir() -> PathBuf {
    match std::env::var_os(STATE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("orphand"),
    }
}

impl SupervisorConfig {
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    pub fn pairs_path(&self) -> PathBuf {
        self.state_dir.join("pairs.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("orphand.lock")
    }

    pub fn daemon_pidfile(&self) -> PathBuf {
        self.state_dir.join("orphand-daemon.pid")
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            check_interval: self.check_interval,
            close_timeout: self.close_timeout,
            kill_timeout: self.kill_timeout,
            exit_after_idle: self.exit_after_idle,
        }
    }
}
