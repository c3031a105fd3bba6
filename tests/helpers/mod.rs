//! Shared harness for the end-to-end suites: in-memory store, scriptable
//! forge, and a manager wired the way `serve --mock` wires one.

#![allow(dead_code)]

use repo_migrator::forge::mock::{MockForge, MockForgeFactory};
use repo_migrator::migration::error::StoreResult;
use repo_migrator::migration::store::ClaimContext;
use repo_migrator::{
    AttemptOutcome, Batch, BatchState, CollisionPolicy, CoreEvent, DestCredentials, DynamicConfig,
    ForgeFactory, ManagerOptions, MemStore, MigrationAttempt, MigrationKind, MigrationManager,
    NewAttempt, NewRepository, RepoState, Repository, RetrySettings, Settings, Store,
    TransitionPatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Settings tuned for fast tests: short backoffs, 1s poll interval.
pub fn test_settings() -> Settings {
    Settings {
        destination_org: "dest-org".to_string(),
        credentials: DestCredentials::Token {
            token: "ghp_test".to_string(),
        },
        worker_count: 2,
        poll_interval_seconds: 1,
        on_exists: CollisionPolicy::Skip,
        retry: RetrySettings {
            base_delay_ms: 10,
            factor: 2.0,
            max_delay_ms: 50,
            budget_seconds: 30,
            max_dry_run_attempts: 3,
            max_live_attempts: 3,
            stale_claim_seconds: 600,
        },
        ..Settings::default()
    }
}

pub struct Harness {
    pub store: Arc<RecordingStore>,
    pub mock: MockForge,
    pub factory: Arc<MockForgeFactory>,
    pub config: Arc<DynamicConfig>,
    pub manager: Arc<MigrationManager>,
}

impl Harness {
    pub async fn new(settings: Settings) -> Self {
        let store = Arc::new(RecordingStore::new(MemStore::with_settings(settings)));
        let mock = MockForge::new();
        let factory = Arc::new(MockForgeFactory::new(mock.clone()));
        let config = DynamicConfig::load(store.clone() as Arc<dyn Store>)
            .await
            .expect("settings must load");
        let manager = MigrationManager::new(
            store.clone() as Arc<dyn Store>,
            config.clone(),
            factory.clone() as Arc<dyn ForgeFactory>,
            ManagerOptions {
                shutdown_grace: Duration::from_secs(10),
                poll_batch_limit: 500,
            },
        )
        .await
        .expect("manager must build");
        Self {
            store,
            mock,
            factory,
            config,
            manager,
        }
    }

    pub async fn insert_repo(&self, full_name: &str, source_url: &str) -> Repository {
        self.store
            .insert_repository(NewRepository::new(full_name, source_url))
            .await
            .unwrap()
    }

    /// Persist new settings and reload, the way the admin surface does.
    pub async fn update_settings(&self, settings: Settings) {
        self.config.update(&settings).await.unwrap();
    }

    pub async fn wait_for_state(&self, id: Uuid, state: RepoState, timeout: Duration) -> Repository {
        let deadline = Instant::now() + timeout;
        loop {
            let repo = self.store.snapshot(id).await.unwrap();
            if repo.state == state {
                return repo;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {state}; repository is in {} (reason: {:?})",
                    repo.state, repo.failure_reason
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_until<F>(&self, id: Uuid, timeout: Duration, predicate: F) -> Repository
    where
        F: Fn(&Repository) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let repo = self.store.snapshot(id).await.unwrap();
            if predicate(&repo) {
                return repo;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for predicate; repository is in {}", repo.state);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn attempts(&self, id: Uuid) -> Vec<MigrationAttempt> {
        self.store.attempts_for(id).await.unwrap()
    }
}

/// Drain the transition events observed so far for one repository.
pub fn drain_transitions(
    rx: &mut broadcast::Receiver<CoreEvent>,
    repository_id: Uuid,
) -> Vec<(RepoState, RepoState)> {
    let mut edges = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::Transition {
            repository_id: id,
            from,
            to,
            ..
        } = event
        {
            if id == repository_id {
                edges.push((from, to));
            }
        }
    }
    edges
}

/// Store decorator asserting ownership exclusivity and counting writes.
///
/// Panics (failing the test) if two workers ever hold the same repository,
/// which is the P-style check the suites lean on.
pub struct RecordingStore {
    inner: MemStore,
    writes: AtomicU64,
    active_claims: Mutex<HashMap<Uuid, String>>,
}

impl RecordingStore {
    pub fn new(inner: MemStore) -> Self {
        Self {
            inner,
            writes: AtomicU64::new(0),
            active_claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn claim_started(&self, repository: Uuid, worker: &str) {
        let mut claims = self.active_claims.lock().unwrap();
        if let Some(current) = claims.get(&repository) {
            panic!("repository {repository} claimed by {worker} while held by {current}");
        }
        claims.insert(repository, worker.to_string());
    }

    fn claim_ended(&self, repository: Uuid) {
        self.active_claims.lock().unwrap().remove(&repository);
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn insert_repository(&self, repo: NewRepository) -> StoreResult<Repository> {
        self.bump();
        self.inner.insert_repository(repo).await
    }

    async fn snapshot(&self, id: Uuid) -> StoreResult<Repository> {
        self.inner.snapshot(id).await
    }

    async fn list_repositories(
        &self,
        states: &[RepoState],
        limit: i64,
    ) -> StoreResult<Vec<Repository>> {
        self.inner.list_repositories(states, limit).await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        ctx: &ClaimContext,
    ) -> StoreResult<Option<Repository>> {
        let claimed = self.inner.claim_next(worker_id, ctx).await?;
        if let Some(repo) = &claimed {
            self.bump();
            self.claim_started(repo.id, worker_id);
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: RepoState,
        new: RepoState,
        patch: TransitionPatch,
    ) -> StoreResult<bool> {
        let releases = matches!(patch.assigned_worker, Some(None));
        let applied = self.inner.transition(id, expected, new, patch).await?;
        if applied {
            self.bump();
            if releases {
                self.claim_ended(id);
            }
        }
        Ok(applied)
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> StoreResult<bool> {
        let released = self.inner.release(id, worker_id).await?;
        if released {
            self.bump();
            self.claim_ended(id);
        }
        Ok(released)
    }

    async fn clear_stale_claims(&self, older_than: ChronoDuration) -> StoreResult<u64> {
        let cleared = self.inner.clear_stale_claims(older_than).await?;
        if cleared > 0 {
            self.bump();
            self.active_claims.lock().unwrap().clear();
        }
        Ok(cleared)
    }

    async fn enumerate_for_status_poll(&self, limit: i64) -> StoreResult<Vec<Repository>> {
        self.inner.enumerate_for_status_poll(limit).await
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> StoreResult<MigrationAttempt> {
        self.bump();
        self.inner.record_attempt(attempt).await
    }

    async fn finish_attempt(
        &self,
        repository_id: Uuid,
        kind: MigrationKind,
        external_migration_id: &str,
        outcome: AttemptOutcome,
        stderr_excerpt: Option<String>,
    ) -> StoreResult<bool> {
        let finished = self
            .inner
            .finish_attempt(repository_id, kind, external_migration_id, outcome, stderr_excerpt)
            .await?;
        if finished {
            self.bump();
        }
        Ok(finished)
    }

    async fn attempts_for(&self, repository_id: Uuid) -> StoreResult<Vec<MigrationAttempt>> {
        self.inner.attempts_for(repository_id).await
    }

    async fn get_settings(&self) -> StoreResult<Settings> {
        self.inner.get_settings().await
    }

    async fn update_settings(&self, settings: &Settings) -> StoreResult<()> {
        self.bump();
        self.inner.update_settings(settings).await
    }

    async fn create_batch(
        &self,
        name: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Batch> {
        self.bump();
        self.inner.create_batch(name, scheduled_at).await
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Batch> {
        self.inner.get_batch(id).await
    }

    async fn set_batch_state(&self, id: Uuid, state: BatchState) -> StoreResult<bool> {
        self.bump();
        self.inner.set_batch_state(id, state).await
    }

    async fn assign_to_batch(&self, repository_id: Uuid, batch_id: Uuid) -> StoreResult<bool> {
        self.bump();
        self.inner.assign_to_batch(repository_id, batch_id).await
    }

    async fn refresh_batches(&self) -> StoreResult<()> {
        self.inner.refresh_batches().await
    }
}
