//! MigrationManager: supervises the worker pool, runs the dispatch and poll
//! loops, reacts to configuration changes, and exposes the in-process
//! control surface (`start`, `stop`, `reload_config`, admin transitions,
//! and the observer event channel).
//!
//! Ownership rules enforced here:
//!   - The dispatch loop claims rows only for idle, non-draining workers.
//!   - The poll loop is the sole authority for externally-driven
//!     transitions; it never touches rows a worker has claimed.
//!   - Pool resizes never interrupt in-flight work: shrink marks the
//!     highest-numbered workers as draining and reaps them once idle.

use super::dynamic_config::DynamicConfig;
use super::error::{MigrationError, Result, StoreResult};
use super::models::{AttemptOutcome, MigrationKind, RepoState, Repository, Settings};
use super::state::{live_chain_index, LIVE_CHAIN};
use super::store::{ClaimContext, Store, TransitionPatch};
use super::worker::MigrationWorker;
use crate::forge::{
    ForgeError, ForgeFactory, ForgeHolder, MigrationPhase, MigrationPoll, MigrationStatus,
};
use chrono::Utc;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events emitted on the read-only observer channel.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Transition {
        repository_id: Uuid,
        from: RepoState,
        to: RepoState,
        at: chrono::DateTime<Utc>,
    },
    PoolPaused {
        reason: String,
    },
    PoolResumed,
}

/// Internal signals raised by workers and subscriptions, consumed by the
/// control loop.
#[derive(Debug)]
pub enum ManagerSignal {
    AuthExpired(String),
    ConfigChanged,
    StoreFatal(String),
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// How long `stop` waits for in-flight transitions before abandoning
    /// them.
    pub shutdown_grace: Duration,
    /// Upper bound on rows examined per poll tick.
    pub poll_batch_limit: i64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
            poll_batch_limit: 500,
        }
    }
}

struct ManagerMetrics {
    registry: Registry,
    claims_total: IntCounter,
    transitions_total: IntCounter,
    failures_total: IntCounter,
    pool_size: IntGauge,
    poll_duration: Histogram,
}

impl ManagerMetrics {
    fn new() -> std::result::Result<Self, prometheus::Error> {
        // A per-instance registry: repeated manager construction (tests,
        // restarts) must not collide in the process-global registry.
        let registry = Registry::new();
        let claims_total =
            IntCounter::new("migrator_claims_total", "Repositories claimed for dispatch")?;
        let transitions_total =
            IntCounter::new("migrator_transitions_total", "State transitions applied")?;
        let failures_total = IntCounter::new(
            "migrator_failures_total",
            "Transitions that ended in a failed state",
        )?;
        let pool_size =
            IntGauge::new("migrator_worker_pool_size", "Active (non-draining) workers")?;
        let poll_duration = Histogram::with_opts(
            HistogramOpts::new("migrator_poll_duration_seconds", "Status poll cycle duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(claims_total.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(failures_total.clone()))?;
        registry.register(Box::new(pool_size.clone()))?;
        registry.register(Box::new(poll_duration.clone()))?;
        Ok(Self {
            registry,
            claims_total,
            transitions_total,
            failures_total,
            pool_size,
            poll_duration,
        })
    }
}

struct WorkerSlot {
    id: String,
    tx: mpsc::Sender<Repository>,
    busy: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WorkerPool {
    slots: Vec<WorkerSlot>,
    retired: Vec<JoinHandle<()>>,
    next_worker: u64,
}

pub struct MigrationManager {
    store: Arc<dyn Store>,
    config: Arc<DynamicConfig>,
    factory: Arc<dyn ForgeFactory>,
    forges: Arc<ForgeHolder>,
    events: broadcast::Sender<CoreEvent>,
    signals_tx: mpsc::UnboundedSender<ManagerSignal>,
    signals_rx: Arc<StdMutex<Option<mpsc::UnboundedReceiver<ManagerSignal>>>>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    dispatch_wake: Arc<Notify>,
    stop_wake: Arc<Notify>,
    pool: Arc<Mutex<WorkerPool>>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    metrics: Arc<ManagerMetrics>,
    options: ManagerOptions,
}

// Moves clones of the shared state into spawned loops, the same way the
// background services in this codebase have always done it.
impl Clone for MigrationManager {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            factory: self.factory.clone(),
            forges: self.forges.clone(),
            events: self.events.clone(),
            signals_tx: self.signals_tx.clone(),
            signals_rx: self.signals_rx.clone(),
            running: self.running.clone(),
            paused: self.paused.clone(),
            dispatch_wake: self.dispatch_wake.clone(),
            stop_wake: self.stop_wake.clone(),
            pool: self.pool.clone(),
            tasks: self.tasks.clone(),
            metrics: self.metrics.clone(),
            options: self.options.clone(),
        }
    }
}

impl MigrationManager {
    pub async fn new(
        store: Arc<dyn Store>,
        config: Arc<DynamicConfig>,
        factory: Arc<dyn ForgeFactory>,
        options: ManagerOptions,
    ) -> Result<Arc<Self>> {
        let settings = config.snapshot().await;
        let initial = factory.build(&settings)?;
        let (events, _) = broadcast::channel(1024);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let metrics = ManagerMetrics::new()
            .map_err(|e| MigrationError::Configuration(format!("metrics setup failed: {e}")))?;

        let manager = Arc::new(Self {
            store,
            config: config.clone(),
            factory,
            forges: Arc::new(ForgeHolder::new(initial)),
            events,
            signals_tx: signals_tx.clone(),
            signals_rx: Arc::new(StdMutex::new(Some(signals_rx))),
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            dispatch_wake: Arc::new(Notify::new()),
            stop_wake: Arc::new(Notify::new()),
            pool: Arc::new(Mutex::new(WorkerPool::default())),
            tasks: Arc::new(StdMutex::new(Vec::new())),
            metrics: Arc::new(metrics),
            options,
        });

        // Config changes reach the control loop as a signal; the callback
        // itself must never block.
        config.subscribe(Arc::new(move |_| {
            let _ = signals_tx.send(ManagerSignal::ConfigChanged);
        }));

        Ok(manager)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics.registry
    }

    pub async fn reload_config(&self) -> Result<bool> {
        self.config.reload().await
    }

    /// Start the dispatch, poll, and control loops and grow the pool to the
    /// configured size.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MigrationError::AlreadyRunning);
        }
        let settings = self.config.snapshot().await;
        let set = self.factory.build(&settings)?;
        self.forges.replace(set).await;
        self.resize_to(settings.worker_count).await;

        let mut tasks = Vec::new();
        let manager = self.clone();
        tasks.push(tokio::spawn(async move { manager.dispatch_loop().await }));
        let manager = self.clone();
        tasks.push(tokio::spawn(async move { manager.poll_loop().await }));
        let manager = self.clone();
        tasks.push(tokio::spawn(async move { manager.control_loop().await }));
        self.tasks.lock().unwrap().extend(tasks);

        info!(
            workers = settings.worker_count,
            poll_interval = settings.poll_interval_seconds,
            "Migration manager started"
        );
        Ok(())
    }

    /// Stop dispatch, signal workers, and wait up to the grace period.
    /// After this returns, no further store writes originate from the core.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping migration manager");
        self.stop_wake.notify_waiters();
        self.dispatch_wake.notify_waiters();

        let deadline = Instant::now() + self.options.shutdown_grace;
        let handles: Vec<JoinHandle<()>> = {
            let mut pool = self.pool.lock().await;
            let slots = std::mem::take(&mut pool.slots);
            let mut handles: Vec<JoinHandle<()>> = slots
                .into_iter()
                .filter_map(|mut slot| slot.handle.take())
                .collect();
            handles.append(&mut pool.retired);
            handles
        };
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!("worker did not checkpoint within grace period; abandoning");
                handle.abort();
            }
        }

        // Loops that were mid-iteration at the first wake settle into their
        // select by now; wake them again before joining.
        self.stop_wake.notify_waiters();
        self.dispatch_wake.notify_waiters();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.metrics.pool_size.set(0);
        info!("Migration manager stopped");
    }

    // ---- administrative surface ----

    /// Conditional cancel: `rolled_back` from `migration_failed`,
    /// `wont_migrate` from any other non-terminal state.
    pub async fn cancel(&self, repository_id: Uuid) -> Result<RepoState> {
        for _ in 0..3 {
            let repo = self.store.snapshot(repository_id).await?;
            if repo.state.is_terminal() {
                return Err(MigrationError::Terminal {
                    repo_id: repository_id,
                    state: repo.state,
                });
            }
            let to = if repo.state == RepoState::MigrationFailed {
                RepoState::RolledBack
            } else {
                RepoState::WontMigrate
            };
            if self
                .transition_event(repository_id, repo.state, to, TransitionPatch::new().release())
                .await?
            {
                return Ok(to);
            }
        }
        let repo = self.store.snapshot(repository_id).await?;
        Err(MigrationError::OwnershipLost {
            repo_id: repository_id,
            state: repo.state,
        })
    }

    /// Put a failed repository back in its queue, keeping attempt counters.
    pub async fn requeue(&self, repository_id: Uuid) -> Result<()> {
        let repo = self.store.snapshot(repository_id).await?;
        let (expected, to, patch) = match repo.state {
            RepoState::DryRunFailed => (
                RepoState::DryRunFailed,
                RepoState::DryRunQueued,
                TransitionPatch::new()
                    .clear_dry_run_migration_id()
                    .clear_failure(),
            ),
            RepoState::MigrationFailed => (
                RepoState::MigrationFailed,
                RepoState::QueuedForMigration,
                TransitionPatch::new()
                    .clear_live_migration_id()
                    .clear_failure(),
            ),
            other => {
                return Err(MigrationError::Configuration(format!(
                    "repository {repository_id} is in {other}, not a failed state"
                )))
            }
        };
        if !self.transition_event(repository_id, expected, to, patch).await? {
            return Err(MigrationError::OwnershipLost {
                repo_id: repository_id,
                state: repo.state,
            });
        }
        self.dispatch_wake.notify_one();
        Ok(())
    }

    /// Admin reset: return a terminal repository to `pending` with fresh
    /// counters and no external identifiers.
    pub async fn reset(&self, repository_id: Uuid) -> Result<()> {
        let repo = self.store.snapshot(repository_id).await?;
        if !repo.state.is_terminal() {
            return Err(MigrationError::Configuration(format!(
                "repository {repository_id} is in {}, not a terminal state",
                repo.state
            )));
        }
        let patch = TransitionPatch::new()
            .clear_dry_run_migration_id()
            .clear_live_migration_id()
            .clear_failure()
            .reset_attempts()
            .release();
        if !self
            .transition_event(repository_id, repo.state, RepoState::Pending, patch)
            .await?
        {
            return Err(MigrationError::OwnershipLost {
                repo_id: repository_id,
                state: repo.state,
            });
        }
        self.dispatch_wake.notify_one();
        Ok(())
    }

    /// Flag a pending repository as needing human intervention.
    pub async fn mark_remediation(&self, repository_id: Uuid, reason: &str) -> Result<()> {
        if !self
            .transition_event(
                repository_id,
                RepoState::Pending,
                RepoState::RemediationRequired,
                TransitionPatch::new().fail(reason),
            )
            .await?
        {
            let repo = self.store.snapshot(repository_id).await?;
            return Err(MigrationError::OwnershipLost {
                repo_id: repository_id,
                state: repo.state,
            });
        }
        Ok(())
    }

    /// Return a remediated repository to the pending queue.
    pub async fn mark_ready(&self, repository_id: Uuid) -> Result<()> {
        if !self
            .transition_event(
                repository_id,
                RepoState::RemediationRequired,
                RepoState::Pending,
                TransitionPatch::new().clear_failure(),
            )
            .await?
        {
            let repo = self.store.snapshot(repository_id).await?;
            return Err(MigrationError::OwnershipLost {
                repo_id: repository_id,
                state: repo.state,
            });
        }
        self.dispatch_wake.notify_one();
        Ok(())
    }

    // ---- loops ----

    async fn dispatch_loop(&self) {
        debug!("dispatch loop running");
        while self.running.load(Ordering::SeqCst) {
            if !self.paused.load(Ordering::SeqCst) {
                self.dispatch_once().await;
            }
            let interval = {
                let settings = self.config.snapshot().await;
                Duration::from_secs(settings.poll_interval_seconds)
            };
            tokio::select! {
                _ = self.dispatch_wake.notified() => {}
                _ = sleep(interval) => {}
            }
        }
        debug!("dispatch loop stopped");
    }

    /// Claim work for every idle worker until the store runs dry.
    async fn dispatch_once(&self) {
        let settings = self.config.snapshot().await;
        let ctx = ClaimContext::from_settings(&settings);
        let mut pool = self.pool.lock().await;
        Self::reap_draining(&mut pool);

        for slot in pool.slots.iter() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if slot.draining.load(Ordering::SeqCst) || slot.busy.load(Ordering::SeqCst) {
                continue;
            }
            match self.store.claim_next(&slot.id, &ctx).await {
                Ok(Some(repo)) => {
                    self.metrics.claims_total.inc();
                    slot.busy.store(true, Ordering::SeqCst);
                    if slot.tx.send(repo.clone()).await.is_err() {
                        // Worker exited underneath us; undo the claim.
                        slot.busy.store(false, Ordering::SeqCst);
                        if let Err(e) = self.store.release(repo.id, &slot.id).await {
                            warn!("failed to release claim for dead worker: {e}");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    let _ = self
                        .signals_tx
                        .send(ManagerSignal::StoreFatal(e.to_string()));
                    break;
                }
                Err(e) => {
                    warn!("claim failed: {e}");
                    break;
                }
            }
        }
    }

    async fn poll_loop(&self) {
        debug!("poll loop running");
        while self.running.load(Ordering::SeqCst) {
            let settings = self.config.snapshot().await;
            let started = Instant::now();
            if let Err(e) = self.poll_tick(&settings).await {
                warn!("status poll tick failed: {e}");
            }
            self.metrics
                .poll_duration
                .observe(started.elapsed().as_secs_f64());
            tokio::select! {
                _ = sleep(Duration::from_secs(settings.poll_interval_seconds)) => {}
                _ = self.stop_wake.notified() => {}
            }
        }
        debug!("poll loop stopped");
    }

    async fn poll_tick(&self, settings: &Settings) -> StoreResult<()> {
        // Janitor duties first: recover rows whose worker died mid-claim and
        // refresh batch rollups.
        let stale = chrono::Duration::seconds(settings.retry.stale_claim_seconds as i64);
        let recovered = self.store.clear_stale_claims(stale).await?;
        if recovered > 0 {
            warn!(recovered, "cleared stale worker claims");
            self.dispatch_wake.notify_one();
        }
        self.store.refresh_batches().await?;

        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }

        let rows = self
            .store
            .enumerate_for_status_poll(self.options.poll_batch_limit)
            .await?;
        if rows.is_empty() {
            return Ok(());
        }
        let forges = self.forges.current().await;
        for repo in rows {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let Some(kind) = repo.state.poll_kind() else {
                continue;
            };
            let external = match kind {
                MigrationKind::DryRun => repo.dry_run_migration_id.clone(),
                MigrationKind::Live => repo.live_migration_id.clone(),
            };
            let Some(external) = external else { continue };

            match forges.dest.poll_migration(&external).await {
                Ok(poll) => {
                    if let Err(e) = self.apply_poll(&repo, kind, &external, poll).await {
                        warn!(repository = %repo.id, "failed to apply poll result: {e}");
                    }
                }
                Err(ForgeError::AuthExpired) => {
                    let _ = self.signals_tx.send(ManagerSignal::AuthExpired(
                        "destination rejected credentials during status poll".to_string(),
                    ));
                    break;
                }
                Err(e @ ForgeError::Transient { .. }) => {
                    debug!(repository = %repo.id, "status poll transient failure: {e}");
                }
                Err(e) => {
                    self.fail_externally(&repo, kind, &external, e.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_poll(
        &self,
        repo: &Repository,
        kind: MigrationKind,
        external: &str,
        poll: MigrationPoll,
    ) -> StoreResult<()> {
        match poll.status {
            MigrationStatus::Running => {
                if kind == MigrationKind::Live {
                    if let Some(phase) = poll.phase {
                        self.advance_live(repo, phase_state(phase)).await?;
                    }
                }
                Ok(())
            }
            MigrationStatus::Succeeded => {
                match kind {
                    MigrationKind::DryRun => {
                        self.transition_event(
                            repo.id,
                            RepoState::DryRunInProgress,
                            RepoState::DryRunComplete,
                            TransitionPatch::new(),
                        )
                        .await?;
                    }
                    MigrationKind::Live => {
                        self.advance_live(repo, RepoState::PostMigration).await?;
                    }
                }
                self.store
                    .finish_attempt(repo.id, kind, external, AttemptOutcome::Succeeded, None)
                    .await?;
                self.dispatch_wake.notify_one();
                Ok(())
            }
            MigrationStatus::Failed => {
                self.fail_externally(
                    repo,
                    kind,
                    external,
                    poll.failure_reason
                        .unwrap_or_else(|| "destination reported failure".to_string()),
                )
                .await
            }
        }
    }

    /// Advance a live row stepwise along the pipeline so each hop is a
    /// recorded, conditional transition.
    async fn advance_live(&self, repo: &Repository, target: RepoState) -> StoreResult<()> {
        let Some(target_index) = live_chain_index(target) else {
            return Ok(());
        };
        let mut current = repo.state;
        while let Some(index) = live_chain_index(current) {
            if index >= target_index {
                break;
            }
            let next = LIVE_CHAIN[index + 1];
            if !self
                .transition_event(repo.id, current, next, TransitionPatch::new())
                .await?
            {
                // Row moved (admin cancel); stop advancing.
                break;
            }
            current = next;
        }
        Ok(())
    }

    async fn fail_externally(
        &self,
        repo: &Repository,
        kind: MigrationKind,
        external: &str,
        reason: String,
    ) -> StoreResult<()> {
        let Some(failed) = repo.state.failed_state() else {
            return Ok(());
        };
        warn!(
            repository = %repo.id,
            %kind,
            external_id = %external,
            "external migration failed: {reason}"
        );
        let excerpt: String = reason.chars().take(500).collect();
        self.transition_event(
            repo.id,
            repo.state,
            failed,
            TransitionPatch::new().fail(reason),
        )
        .await?;
        self.store
            .finish_attempt(repo.id, kind, external, AttemptOutcome::Failed, Some(excerpt))
            .await?;
        self.metrics.failures_total.inc();

        // Best-effort staging cleanup on the destination.
        let forges = self.forges.current().await;
        if let Err(e) = forges.dest.cleanup(external).await {
            debug!("cleanup failed: {e}");
        }
        self.dispatch_wake.notify_one();
        Ok(())
    }

    async fn control_loop(&self) {
        let receiver = self.signals_rx.lock().unwrap().take();
        let Some(mut signals) = receiver else {
            error!("control loop started twice; signals receiver is gone");
            return;
        };
        debug!("control loop running");
        loop {
            tokio::select! {
                _ = self.stop_wake.notified() => break,
                signal = signals.recv() => match signal {
                    None => break,
                    Some(ManagerSignal::AuthExpired(reason)) => {
                        if !self.paused.swap(true, Ordering::SeqCst) {
                            warn!("pausing worker pool: {reason}");
                            let _ = self.events.send(CoreEvent::PoolPaused { reason });
                        }
                    }
                    Some(ManagerSignal::ConfigChanged) => {
                        self.apply_config_change().await;
                    }
                    Some(ManagerSignal::StoreFatal(message)) => {
                        error!("fatal store error, shutting down the pool: {message}");
                        self.running.store(false, Ordering::SeqCst);
                        self.stop_wake.notify_waiters();
                        self.dispatch_wake.notify_waiters();
                        // Dropping the senders lets each worker exit once its
                        // current transition completes.
                        let mut pool = self.pool.lock().await;
                        let slots = std::mem::take(&mut pool.slots);
                        for mut slot in slots {
                            if let Some(handle) = slot.handle.take() {
                                pool.retired.push(handle);
                            }
                        }
                        break;
                    }
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }
        debug!("control loop stopped");
    }

    async fn apply_config_change(&self) {
        let settings = self.config.snapshot().await;
        match self.factory.build(&settings) {
            Ok(set) => self.forges.replace(set).await,
            Err(e) => warn!("failed to rebuild forge clients: {e}"),
        }
        self.resize_to(settings.worker_count).await;
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("worker pool resumed after configuration change");
            let _ = self.events.send(CoreEvent::PoolResumed);
        }
        self.dispatch_wake.notify_one();
    }

    /// Converge the pool to the target size. Growth spawns immediately;
    /// shrink marks the highest-numbered workers draining and reaps them
    /// once their current work is done.
    async fn resize_to(&self, target: usize) {
        let mut pool = self.pool.lock().await;
        Self::reap_draining(&mut pool);
        let active = pool
            .slots
            .iter()
            .filter(|s| !s.draining.load(Ordering::SeqCst))
            .count();
        if target > active {
            for _ in active..target {
                self.spawn_worker(&mut pool);
            }
            info!(from = active, to = target, "worker pool grown");
        } else if target < active {
            let mut to_drain = active - target;
            for slot in pool.slots.iter().rev() {
                if to_drain == 0 {
                    break;
                }
                if !slot.draining.swap(true, Ordering::SeqCst) {
                    to_drain -= 1;
                }
            }
            info!(from = active, to = target, "worker pool draining down");
        }
        self.metrics.pool_size.set(target as i64);
        self.dispatch_wake.notify_one();
    }

    fn spawn_worker(&self, pool: &mut WorkerPool) {
        let id = format!("worker-{}", pool.next_worker);
        pool.next_worker += 1;
        let (tx, mut rx) = mpsc::channel::<Repository>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let draining = Arc::new(AtomicBool::new(false));

        let worker = MigrationWorker::new(
            id.clone(),
            self.store.clone(),
            self.config.clone(),
            self.forges.clone(),
            self.events.clone(),
            self.signals_tx.clone(),
        );
        let wake = self.dispatch_wake.clone();
        let worker_busy = busy.clone();
        let handle = tokio::spawn(async move {
            while let Some(repo) = rx.recv().await {
                worker.process(repo).await;
                worker_busy.store(false, Ordering::SeqCst);
                wake.notify_one();
            }
            debug!(worker = %worker.id(), "worker exited");
        });

        debug!(worker = %id, "worker spawned");
        pool.slots.push(WorkerSlot {
            id,
            tx,
            busy,
            draining,
            handle: Some(handle),
        });
    }

    /// Remove idle draining workers; dropping the sender ends their loop.
    fn reap_draining(pool: &mut WorkerPool) {
        let mut index = 0;
        while index < pool.slots.len() {
            let slot = &pool.slots[index];
            if slot.draining.load(Ordering::SeqCst) && !slot.busy.load(Ordering::SeqCst) {
                let mut slot = pool.slots.remove(index);
                if let Some(handle) = slot.handle.take() {
                    pool.retired.push(handle);
                }
            } else {
                index += 1;
            }
        }
    }

    async fn transition_event(
        &self,
        repository_id: Uuid,
        from: RepoState,
        to: RepoState,
        patch: TransitionPatch,
    ) -> StoreResult<bool> {
        let applied = self
            .store
            .transition(repository_id, from, to, patch)
            .await?;
        if applied && from != to {
            self.metrics.transitions_total.inc();
            let _ = self.events.send(CoreEvent::Transition {
                repository_id,
                from,
                to,
                at: Utc::now(),
            });
        }
        Ok(applied)
    }

    /// Current number of non-draining worker slots, for observers and tests.
    pub async fn active_workers(&self) -> usize {
        let pool = self.pool.lock().await;
        pool.slots
            .iter()
            .filter(|s| !s.draining.load(Ordering::SeqCst))
            .count()
    }
}

fn phase_state(phase: MigrationPhase) -> RepoState {
    match phase {
        MigrationPhase::PreparingArchive => RepoState::ArchiveGenerating,
        MigrationPhase::Queued => RepoState::QueuedForMigration,
        MigrationPhase::Migrating => RepoState::MigratingContent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_state_mapping() {
        assert_eq!(
            phase_state(MigrationPhase::PreparingArchive),
            RepoState::ArchiveGenerating
        );
        assert_eq!(
            phase_state(MigrationPhase::Queued),
            RepoState::QueuedForMigration
        );
        assert_eq!(
            phase_state(MigrationPhase::Migrating),
            RepoState::MigratingContent
        );
    }

    #[test]
    fn test_manager_options_defaults() {
        let options = ManagerOptions::default();
        assert_eq!(options.shutdown_grace, Duration::from_secs(30));
        assert_eq!(options.poll_batch_limit, 500);
    }
}
