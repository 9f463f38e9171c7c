//! orphand supervises registered main/child process pairs.
//!
//! Each pair names a main process and a child it is responsible for. While
//! the main process lives the pair is left alone; once the main process
//! exits, the child is asked to close and force-killed if it refuses. A
//! leader lock keeps supervision of a state directory in exactly one
//! process, and the registered pairs are persisted so a restarted
//! supervisor can clean up orphans it missed while down.

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod exit_watch;
pub mod lock;
pub mod pair;
pub mod probe;
pub mod state;
pub mod store;

pub use config::{SupervisorConfig, STATE_DIR_ENV};
pub use coordinator::{with_exclusive_access, with_exclusive_access_using, Coordinator};
pub use daemon::DaemonLauncher;
pub use engine::{EngineConfig, EngineEvent, MonitorEngine, RemovalReason};
pub use error::{Result, SupervisorError};
pub use pair::ProcessPair;
pub use probe::{ProcessProbe, SystemProbe, TerminationOutcome};
pub use state::PairState;
pub use store::PairStore;
