//! Supervisor errors
//! Expected conditions (missing process, lock contention) are modeled here;
//! the liveness probe itself never errors and degrades to "not running".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid pair: {0}")]
    InvalidPair(String),

    #[error("no running process with pid {0}")]
    ProcessNotFound(u32),

    #[error("a pair with main pid {0} is already monitored")]
    AlreadyMonitored(u32),

    #[error("another supervisor instance already holds the leader lock")]
    LockUnavailable,

    #[error("failed to terminate process {0}")]
    TerminationFailed(u32),

    #[error("lock file error: {0}")]
    Lock(#[source] std::io::Error),

    #[error("persistence failure: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("failed to launch supervisor daemon: {0}")]
    Launch(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
