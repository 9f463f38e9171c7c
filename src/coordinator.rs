//! Coordinator tying the engine, store, and leader lock together
//!
//! One coordinator owns supervision for a state directory. Startup takes the
//! leader lock, reconciles persisted pairs against the live process table,
//! and seeds the engine; from then on every membership change is persisted.

use crate::config::SupervisorConfig;
use crate::daemon::DaemonLauncher;
use crate::engine::{EngineEvent, MonitorEngine};
use crate::error::{Result, SupervisorError};
use crate::lock::LeaderLock;
use crate::pair::ProcessPair;
use crate::probe::{ProcessProbe, SystemProbe};
use crate::store::PairStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Boxed future over a borrowed coordinator, used by exclusive-access actions.
pub type CoordinatorAction<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a>>;

pub struct Coordinator {
    config: SupervisorConfig,
    probe: Arc<dyn ProcessProbe>,
    engine: Arc<MonitorEngine>,
    events: Mutex<Option<UnboundedReceiver<EngineEvent>>>,
    store: PairStore,
    // Held for the coordinator's whole life; released on drop.
    _lock: LeaderLock,
}

impl Coordinator {
    /// Take the leader lock for `config.state_dir` and reconcile persisted
    /// pairs. Fails with `LockUnavailable` when another supervisor is live.
    pub async fn start(config: SupervisorConfig) -> Result<Self> {
        Self::start_with_probe(config, Arc::new(SystemProbe::new())).await
    }

    pub async fn start_with_probe(
        config: SupervisorConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self> {
        let mut lock = LeaderLock::new(config.lock_path());
        match lock.acquire() {
            Ok(true) => {}
            Ok(false) => return Err(SupervisorError::LockUnavailable),
            Err(e) => return Err(SupervisorError::Lock(e)),
        }

        let store = PairStore::new(config.pairs_path());
        let (engine, events) = MonitorEngine::new(Arc::clone(&probe), config.engine_config());
        let coordinator = Self {
            config,
            probe,
            engine,
            events: Mutex::new(Some(events)),
            store,
            _lock: lock,
        };
        coordinator.reconcile().await?;
        Ok(coordinator)
    }

    /// Replay persisted pairs against the live process table. Pairs whose
    /// processes both survive resume supervision; orphaned children left over
    /// from a previous run are terminated; everything else is dropped.
    async fn reconcile(&self) -> Result<()> {
        let persisted = self.store.load_all();
        if persisted.is_empty() {
            return Ok(());
        }
        info!(count = persisted.len(), "reconciling persisted pairs");

        let mut kept = Vec::new();
        for pair in persisted {
            let main_alive = self.probe.is_running(pair.main_pid);
            let child_alive = self.probe.is_running(pair.child_pid);
            match (main_alive, child_alive) {
                (true, true) => match self.engine.start_monitoring(pair.clone()) {
                    Ok(()) => kept.push(pair),
                    Err(e) => {
                        warn!(
                            main_pid = pair.main_pid,
                            child_pid = pair.child_pid,
                            error = %e,
                            "failed to resume pair"
                        );
                    }
                },
                (false, true) => {
                    warn!(
                        main_pid = pair.main_pid,
                        child_pid = pair.child_pid,
                        child_name = %pair.child_name,
                        "found orphaned child from previous run, terminating"
                    );
                    let outcome = self
                        .probe
                        .terminate_gracefully(
                            pair.child_pid,
                            self.config.close_timeout,
                            self.config.kill_timeout,
                        )
                        .await;
                    debug!(child_pid = pair.child_pid, ?outcome, "orphan termination finished");
                    // Dropped from the registry either way; a survivor has no
                    // main process left to pair it with.
                }
                _ => {
                    debug!(
                        main_pid = pair.main_pid,
                        child_pid = pair.child_pid,
                        "dropping stale pair"
                    );
                }
            }
        }
        self.store
            .save_all(&kept)
            .map_err(SupervisorError::Persistence)?;
        Ok(())
    }

    /// Register and persist a new pair. Registering an already-tracked main
    /// pid is a no-op.
    pub async fn add_pair(&self, main_pid: u32, child_pid: u32) -> Result<()> {
        let mut pair = ProcessPair::new(main_pid, child_pid)?;
        if !self.probe.is_running(main_pid) {
            return Err(SupervisorError::ProcessNotFound(main_pid));
        }
        if !self.probe.is_running(child_pid) {
            return Err(SupervisorError::ProcessNotFound(child_pid));
        }
        pair = pair.with_names(self.probe.name_of(main_pid), self.probe.name_of(child_pid));

        match self.engine.start_monitoring(pair.clone()) {
            Ok(()) => {}
            Err(SupervisorError::AlreadyMonitored(_)) => {
                debug!(main_pid, child_pid, "pair already monitored");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let mut persisted = self.store.load_all();
        if !persisted.iter().any(|p| p.main_pid == main_pid) {
            persisted.push(pair);
            self.store
                .save_all(&persisted)
                .map_err(SupervisorError::Persistence)?;
        }
        Ok(())
    }

    /// Unregister a pair without touching either process. True when the pair
    /// was known, in memory or on disk.
    pub async fn remove_pair(&self, main_pid: u32, child_pid: u32) -> Result<bool> {
        let in_engine = self.engine.stop_monitoring(main_pid, child_pid);

        let mut persisted = self.store.load_all();
        let before = persisted.len();
        persisted.retain(|p| !p.matches(main_pid, child_pid));
        let on_disk = persisted.len() != before;
        if on_disk {
            self.store
                .save_all(&persisted)
                .map_err(SupervisorError::Persistence)?;
        }
        Ok(in_engine || on_disk)
    }

    pub fn list_pairs(&self) -> Vec<ProcessPair> {
        self.engine.snapshot()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run supervision until cancelled. Engine events are persisted as they
    /// arrive so the on-disk registry tracks the in-memory one.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = match self.events.lock() {
            Ok(mut slot) => match slot.take() {
                Some(rx) => rx,
                None => {
                    warn!("coordinator run loop already started");
                    return;
                }
            },
            Err(_) => return,
        };

        let engine = Arc::clone(&self.engine);
        let engine_cancel = cancel.clone();
        let engine_loop = async move { engine.run(engine_cancel).await };
        tokio::pin!(engine_loop);

        loop {
            tokio::select! {
                _ = &mut engine_loop => break,
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        // Persist anything the engine settled while we were exiting.
        while let Ok(event) = events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::MainExited { pair } => {
                debug!(main_pid = pair.main_pid, "main exit observed");
            }
            EngineEvent::PairRemoved { pair, reason } => {
                info!(
                    main_pid = pair.main_pid,
                    child_pid = pair.child_pid,
                    %reason,
                    "pair removed"
                );
                if let Err(e) = self.store.save_all(&self.engine.snapshot()) {
                    warn!(error = %e, "failed to persist pair removal");
                }
            }
        }
    }
}

/// Run `action` while holding exclusive supervision of the state directory.
///
/// If a daemon currently owns the directory it is stopped first and started
/// again afterwards, so a CLI mutation never races the daemon's scans.
pub async fn with_exclusive_access<T, F>(config: SupervisorConfig, action: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a Coordinator) -> CoordinatorAction<'a, T>,
{
    let launcher = DaemonLauncher::new(&config);
    with_exclusive_access_using(config, launcher, action).await
}

/// Like [`with_exclusive_access`] but with a caller-supplied launcher, which
/// lets tests point daemon relaunch at an explicit binary.
pub async fn with_exclusive_access_using<T, F>(
    config: SupervisorConfig,
    mut launcher: DaemonLauncher,
    action: F,
) -> Result<T>
where
    F: for<'a> FnOnce(&'a Coordinator) -> CoordinatorAction<'a, T>,
{
    let daemon_pid = launcher.discover();
    if let Some(pid) = daemon_pid {
        info!(pid, "suspending daemon for exclusive access");
        if !launcher.terminate().await? {
            return Err(SupervisorError::TerminationFailed(pid));
        }
    }

    let coordinator = start_with_retry(config.clone()).await?;
    let result = action(&coordinator).await;
    // Release the leader lock before relaunching.
    drop(coordinator);

    if daemon_pid.is_some() {
        if let Err(e) = launcher.launch(&config) {
            warn!(error = %e, "failed to resume daemon after exclusive access");
        }
    }
    result
}

/// A dying daemon holds the leader lock until its process is fully gone, so
/// retry briefly on contention instead of failing outright.
async fn start_with_retry(config: SupervisorConfig) -> Result<Coordinator> {
    let mut attempts = 0u32;
    loop {
        match Coordinator::start(config.clone()).await {
            Err(SupervisorError::LockUnavailable) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TerminationOutcome;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct MockProbe {
        running: Mutex<HashSet<u32>>,
        kill_succeeds: bool,
    }

    impl MockProbe {
        fn with_running(pids: &[u32]) -> Arc<Self> {
            Arc::new(Self {
                running: Mutex::new(pids.iter().copied().collect()),
                kill_succeeds: true,
            })
        }

        fn unkillable(pids: &[u32]) -> Arc<Self> {
            Arc::new(Self {
                running: Mutex::new(pids.iter().copied().collect()),
                kill_succeeds: false,
            })
        }

        fn mark_dead(&self, pid: u32) {
            self.running.lock().unwrap().remove(&pid);
        }
    }

    #[async_trait]
    impl ProcessProbe for MockProbe {
        fn is_running(&self, pid: u32) -> bool {
            self.running.lock().unwrap().contains(&pid)
        }

        fn name_of(&self, pid: u32) -> String {
            format!("proc-{pid}")
        }

        async fn terminate_gracefully(
            &self,
            pid: u32,
            _close_timeout: Duration,
            _kill_timeout: Duration,
        ) -> TerminationOutcome {
            if !self.kill_succeeds {
                return TerminationOutcome::Failed;
            }
            self.running.lock().unwrap().remove(&pid);
            TerminationOutcome::Exited
        }
    }

    fn test_config(dir: &TempDir) -> SupervisorConfig {
        SupervisorConfig::with_state_dir(dir.path())
    }

    #[tokio::test]
    async fn test_add_and_list_pairs() {
        let dir = TempDir::new().unwrap();
        let probe = MockProbe::with_running(&[100, 200]);
        let coord = Coordinator::start_with_probe(test_config(&dir), probe)
            .await
            .unwrap();

        coord.add_pair(100, 200).await.unwrap();
        let pairs = coord.list_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].main_pid, 100);
        assert_eq!(pairs[0].main_name, "proc-100");
    }

    #[tokio::test]
    async fn test_add_pair_rejects_dead_process() {
        let dir = TempDir::new().unwrap();
        let probe = MockProbe::with_running(&[100]);
        let coord = Coordinator::start_with_probe(test_config(&dir), probe)
            .await
            .unwrap();
        let err = coord.add_pair(100, 200).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessNotFound(200)));
        assert!(coord.list_pairs().is_empty());
    }

    #[tokio::test]
    async fn test_add_pair_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let probe = MockProbe::with_running(&[100, 200]);
        let coord = Coordinator::start_with_probe(test_config(&dir), probe)
            .await
            .unwrap();
        coord.add_pair(100, 200).await.unwrap();
        coord.add_pair(100, 200).await.unwrap();
        assert_eq!(coord.list_pairs().len(), 1);
    }

    #[tokio::test]
    async fn test_add_pair_persists_to_store() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let probe = MockProbe::with_running(&[100, 200]);
        let coord = Coordinator::start_with_probe(config.clone(), probe)
            .await
            .unwrap();
        coord.add_pair(100, 200).await.unwrap();

        let on_disk = PairStore::new(config.pairs_path()).load_all();
        assert_eq!(on_disk.len(), 1);
        assert!(on_disk[0].matches(100, 200));
    }

    #[tokio::test]
    async fn test_remove_pair_clears_memory_and_disk() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let probe = MockProbe::with_running(&[100, 200]);
        let coord = Coordinator::start_with_probe(config.clone(), probe)
            .await
            .unwrap();
        coord.add_pair(100, 200).await.unwrap();

        assert!(coord.remove_pair(100, 200).await.unwrap());
        assert!(coord.list_pairs().is_empty());
        assert!(PairStore::new(config.pairs_path()).load_all().is_empty());

        assert!(!coord.remove_pair(100, 200).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_coordinator_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let probe = MockProbe::with_running(&[]);
        let _first = Coordinator::start_with_probe(config.clone(), probe.clone())
            .await
            .unwrap();
        let err = Coordinator::start_with_probe(config, probe)
            .await
            .err()
            .expect("second coordinator should be locked out");
        assert!(matches!(err, SupervisorError::LockUnavailable));
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let probe = MockProbe::with_running(&[]);
        {
            let _coord =
                Coordinator::start_with_probe(config.clone(), probe.clone())
                    .await
                    .unwrap();
        }
        Coordinator::start_with_probe(config, probe).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_resumes_live_pairs() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = PairStore::new(config.pairs_path());
        store
            .save_all(&[
                ProcessPair::new(100, 200).unwrap(),
                ProcessPair::new(300, 400).unwrap(),
            ])
            .unwrap();

        // 300 is gone along with its child; only 100/200 survives.
        let probe = MockProbe::with_running(&[100, 200]);
        let coord = Coordinator::start_with_probe(config, probe).await.unwrap();
        let pairs = coord.list_pairs();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].matches(100, 200));
        assert_eq!(store.load_all().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_terminates_orphaned_child() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = PairStore::new(config.pairs_path());
        store
            .save_all(&[ProcessPair::new(100, 200).unwrap()])
            .unwrap();

        // Main died while no supervisor was running; child 200 lingers.
        let probe = MockProbe::with_running(&[200]);
        let coord = Coordinator::start_with_probe(config, probe.clone())
            .await
            .unwrap();
        assert!(!probe.is_running(200));
        assert!(coord.list_pairs().is_empty());
        assert!(store.load_all().is_empty());
    }

    #[tokio::test]
    async fn test_run_persists_engine_removals() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut config = config;
        config.check_interval = Duration::from_millis(20);
        let probe = MockProbe::with_running(&[100, 200]);
        let coord = Coordinator::start_with_probe(config.clone(), probe.clone())
            .await
            .unwrap();
        coord.add_pair(100, 200).await.unwrap();

        probe.mark_dead(100);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::select! {
            _ = coord.run(cancel) => {}
            _ = async {
                for _ in 0..100 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if PairStore::new(config.pairs_path()).load_all().is_empty() {
                        break;
                    }
                }
                stop.cancel();
            } => {}
        }

        assert!(!probe.is_running(200));
        assert!(PairStore::new(config.pairs_path()).load_all().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_access_fails_when_daemon_survives() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        // A daemon is advertised and refuses to die.
        crate::daemon::publish_pid(&config.daemon_pidfile(), 4242).unwrap();
        let probe = MockProbe::unkillable(&[4242]);
        let launcher = DaemonLauncher::with_probe(&config, probe);

        let err = with_exclusive_access_using(config, launcher, |_coord| {
            Box::pin(async move { Ok(()) })
        })
        .await
        .err()
        .expect("exclusive access should fail when the daemon survives");
        assert!(matches!(err, SupervisorError::TerminationFailed(4242)));
    }

    #[tokio::test]
    async fn test_with_exclusive_access_runs_action() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        // No daemon pid file exists, so this is just lock + action.
        let listed = with_exclusive_access(config, |coord| {
            Box::pin(async move { Ok(coord.list_pairs()) })
        })
        .await
        .unwrap();
        assert!(listed.is_empty());
    }
}
