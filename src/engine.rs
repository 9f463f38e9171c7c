//! In-memory supervision engine
//!
//! Tracks registered pairs, scans them on an interval, and terminates the
//! child of any pair whose main process has exited. Terminations run as
//! spawned tasks so a slow or stubborn child never stalls the scan loop.

use crate::error::{Result, SupervisorError};
use crate::exit_watch;
use crate::pair::ProcessPair;
use crate::probe::{ProcessProbe, TerminationOutcome};
use crate::state::PairState;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables for the scan loop and termination escalation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often every tracked pair is re-checked.
    pub check_interval: Duration,
    /// How long a child gets to close gracefully before being killed.
    pub close_timeout: Duration,
    /// How long to wait for the child to disappear after a force kill.
    pub kill_timeout: Duration,
    /// Stop the run loop after being empty for this long. None runs forever.
    pub exit_after_idle: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
            close_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            exit_after_idle: None,
        }
    }
}

/// A registered pair plus its supervision state.
#[derive(Debug)]
pub struct TrackedPair {
    pub pair: ProcessPair,
    state: AtomicU8,
    retries: AtomicU32,
}

impl TrackedPair {
    fn new(pair: ProcessPair) -> Self {
        Self {
            pair,
            state: AtomicU8::new(PairState::Active as u8),
            retries: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> PairState {
        PairState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: PairState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Transition iff currently in `from` and the move is legal. The CAS is
    /// what keeps a pair from being terminated twice by the scan loop and the
    /// exit-event fast path racing each other.
    fn try_transition(&self, from: PairState, to: PairState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Why a pair left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Both processes were already gone.
    MainAndChildGone,
    /// The child exited on its own while the main still ran.
    ChildExited,
    /// The main exited and the engine terminated the child.
    ChildTerminated(TerminationOutcome),
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MainAndChildGone => write!(f, "main and child both gone"),
            Self::ChildExited => write!(f, "child exited on its own"),
            Self::ChildTerminated(TerminationOutcome::Exited) => {
                write!(f, "child closed gracefully")
            }
            Self::ChildTerminated(TerminationOutcome::Killed) => write!(f, "child force-killed"),
            Self::ChildTerminated(TerminationOutcome::Failed) => {
                write!(f, "child termination failed")
            }
        }
    }
}

/// Notifications the engine emits as pairs change.
#[derive(Debug)]
pub enum EngineEvent {
    /// A main process was observed to have exited; child termination started.
    MainExited { pair: ProcessPair },
    /// A pair was removed from tracking.
    PairRemoved {
        pair: ProcessPair,
        reason: RemovalReason,
    },
}

/// Supervision engine over a set of main/child pairs.
pub struct MonitorEngine {
    probe: Arc<dyn ProcessProbe>,
    config: EngineConfig,
    pairs: RwLock<HashMap<u32, Arc<TrackedPair>>>,
    check_tx: UnboundedSender<u32>,
    check_rx: Mutex<Option<UnboundedReceiver<u32>>>,
    event_tx: UnboundedSender<EngineEvent>,
    // In-flight child terminations; drained with a grace period on shutdown
    // so an escalation already past SIGTERM still reaches the SIGKILL step.
    terminations: Mutex<JoinSet<()>>,
}

impl MonitorEngine {
    /// Build an engine and the receiver for its event stream.
    pub fn new(
        probe: Arc<dyn ProcessProbe>,
        config: EngineConfig,
    ) -> (Arc<Self>, UnboundedReceiver<EngineEvent>) {
        let (check_tx, check_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            probe,
            config,
            pairs: RwLock::new(HashMap::new()),
            check_tx,
            check_rx: Mutex::new(Some(check_rx)),
            event_tx,
            terminations: Mutex::new(JoinSet::new()),
        });
        (engine, event_rx)
    }

    fn pairs_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u32, Arc<TrackedPair>>> {
        match self.pairs.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pairs_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u32, Arc<TrackedPair>>> {
        match self.pairs.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a pair for supervision. Both processes must be alive and the
    /// main pid must not already be tracked.
    pub fn start_monitoring(&self, pair: ProcessPair) -> Result<()> {
        if !self.probe.is_running(pair.main_pid) {
            return Err(SupervisorError::ProcessNotFound(pair.main_pid));
        }
        if !self.probe.is_running(pair.child_pid) {
            return Err(SupervisorError::ProcessNotFound(pair.child_pid));
        }
        let main_pid = pair.main_pid;
        {
            let mut pairs = self.pairs_write();
            if pairs.contains_key(&main_pid) {
                return Err(SupervisorError::AlreadyMonitored(main_pid));
            }
            pairs.insert(main_pid, Arc::new(TrackedPair::new(pair.clone())));
        }
        info!(
            main_pid,
            child_pid = pair.child_pid,
            main_name = %pair.main_name,
            "monitoring pair"
        );
        if exit_watch::watch(main_pid, self.check_tx.clone()) {
            debug!(main_pid, "exit watch armed");
        }
        Ok(())
    }

    /// Drop a pair without touching either process. Returns whether the exact
    /// (main, child) tuple was tracked.
    pub fn stop_monitoring(&self, main_pid: u32, child_pid: u32) -> bool {
        let mut pairs = self.pairs_write();
        match pairs.get(&main_pid) {
            Some(tracked) if tracked.pair.matches(main_pid, child_pid) => {
                tracked.set_state(PairState::Removed);
                pairs.remove(&main_pid);
                info!(main_pid, child_pid, "stopped monitoring pair");
                true
            }
            _ => false,
        }
    }

    /// Currently tracked pairs, excluding any already marked removed.
    pub fn snapshot(&self) -> Vec<ProcessPair> {
        let mut pairs: Vec<ProcessPair> = self
            .pairs_read()
            .values()
            .filter(|t| !t.state().is_terminal())
            .map(|t| t.pair.clone())
            .collect();
        pairs.sort_by_key(|p| p.main_pid);
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs_read().is_empty()
    }

    /// Run the scan loop until cancelled (or idle long enough, if configured).
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let mut check_rx = match self.check_rx.lock() {
            Ok(mut slot) => match slot.take() {
                Some(rx) => rx,
                None => {
                    error!("engine run loop already started");
                    return;
                }
            },
            Err(_) => {
                error!("engine check channel poisoned");
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_since: Option<tokio::time::Instant> = None;

        info!(
            interval_ms = self.config.check_interval.as_millis() as u64,
            "engine started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("engine stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.scan();
                    // Collect any terminations that have already finished.
                    while self.terminations_lock().try_join_next().is_some() {}
                    if let Some(max_idle) = self.config.exit_after_idle {
                        if self.is_empty() {
                            let since = idle_since.get_or_insert_with(tokio::time::Instant::now);
                            if since.elapsed() >= max_idle {
                                info!("no pairs tracked, engine exiting");
                                break;
                            }
                        } else {
                            idle_since = None;
                        }
                    }
                }
                Some(main_pid) = check_rx.recv() => {
                    debug!(main_pid, "exit event received");
                    self.check_main(main_pid);
                }
            }
        }
        self.drain_terminations().await;
    }

    /// Re-evaluate every tracked pair against the process table.
    pub fn scan(self: &Arc<Self>) {
        let tracked: Vec<Arc<TrackedPair>> = self.pairs_read().values().cloned().collect();
        for t in tracked {
            self.evaluate(&t);
        }
    }

    fn check_main(self: &Arc<Self>, main_pid: u32) {
        let tracked = self.pairs_read().get(&main_pid).cloned();
        if let Some(t) = tracked {
            self.evaluate(&t);
        }
    }

    fn evaluate(self: &Arc<Self>, tracked: &Arc<TrackedPair>) {
        if tracked.state() != PairState::Active {
            return;
        }
        let pair = &tracked.pair;
        let main_alive = self.probe.is_running(pair.main_pid);
        let child_alive = self.probe.is_running(pair.child_pid);

        match (main_alive, child_alive) {
            (true, true) => {}
            (true, false) => {
                if tracked.try_transition(PairState::Active, PairState::Removed) {
                    info!(
                        main_pid = pair.main_pid,
                        child_pid = pair.child_pid,
                        "child exited on its own, dropping pair"
                    );
                    self.remove_entry(pair.main_pid);
                    self.emit(EngineEvent::PairRemoved {
                        pair: pair.clone(),
                        reason: RemovalReason::ChildExited,
                    });
                }
            }
            (false, false) => {
                if tracked.try_transition(PairState::Active, PairState::Removed) {
                    debug!(
                        main_pid = pair.main_pid,
                        child_pid = pair.child_pid,
                        "both processes gone, dropping pair"
                    );
                    self.remove_entry(pair.main_pid);
                    self.emit(EngineEvent::PairRemoved {
                        pair: pair.clone(),
                        reason: RemovalReason::MainAndChildGone,
                    });
                }
            }
            (false, true) => {
                if tracked.try_transition(PairState::Active, PairState::Terminating) {
                    warn!(
                        main_pid = pair.main_pid,
                        child_pid = pair.child_pid,
                        child_name = %pair.child_name,
                        "main process exited, terminating orphaned child"
                    );
                    self.emit(EngineEvent::MainExited { pair: pair.clone() });
                    let engine = Arc::clone(self);
                    let tracked = Arc::clone(tracked);
                    self.terminations_lock().spawn(async move {
                        engine.terminate_child(tracked).await;
                    });
                }
            }
        }
    }

    async fn terminate_child(self: Arc<Self>, tracked: Arc<TrackedPair>) {
        let pair = tracked.pair.clone();
        let outcome = self
            .probe
            .terminate_gracefully(pair.child_pid, self.config.close_timeout, self.config.kill_timeout)
            .await;

        match outcome {
            TerminationOutcome::Exited | TerminationOutcome::Killed => {
                tracked.set_state(PairState::Removed);
                self.remove_entry(pair.main_pid);
                info!(
                    main_pid = pair.main_pid,
                    child_pid = pair.child_pid,
                    outcome = ?outcome,
                    "orphaned child terminated"
                );
                self.emit(EngineEvent::PairRemoved {
                    pair,
                    reason: RemovalReason::ChildTerminated(outcome),
                });
            }
            TerminationOutcome::Failed => {
                let attempt = tracked.retries.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    main_pid = pair.main_pid,
                    child_pid = pair.child_pid,
                    attempt,
                    "child survived termination, will retry on next scan"
                );
                // Back to Active so the next scan picks it up again.
                tracked.try_transition(PairState::Terminating, PairState::Active);
            }
        }
    }

    fn remove_entry(&self, main_pid: u32) {
        self.pairs_write().remove(&main_pid);
    }

    fn terminations_lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        match self.terminations.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait, up to one full escalation plus margin, for spawned termination
    /// tasks to settle.
    async fn drain_terminations(&self) {
        let mut tasks = std::mem::take(&mut *self.terminations_lock());
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "waiting for terminations to settle");
        let grace = self.config.close_timeout + self.config.kill_timeout + Duration::from_secs(2);
        let settle = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, settle).await.is_err() {
            warn!("termination tasks did not settle within the grace period");
        }
    }

    fn emit(&self, event: EngineEvent) {
        // The receiver may be gone during shutdown.
        let _ = self.event_tx.send(event);
    }
}
