//! In-memory Store used by the test suites and `serve --mock`.
//!
//! Implements the exact conditional-update contract of the Postgres store:
//! claims stamp ownership only where none exists, transitions are validated
//! against the state graph and keyed on the expected state.

use super::error::{StoreError, StoreResult};
use super::models::{
    AttemptOutcome, Batch, BatchState, MigrationAttempt, MigrationKind, NewAttempt, NewRepository,
    RepoState, Repository, Settings,
};
use super::state::{self, ClaimRequirement};
use super::store::{ClaimContext, Store, TransitionPatch};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    repositories: HashMap<Uuid, Repository>,
    batches: HashMap<Uuid, Batch>,
    attempts: Vec<MigrationAttempt>,
    settings: Option<Settings>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = Self::new();
        store.inner.lock().unwrap().settings = Some(settings);
        store
    }

    fn batch_gate_open(inner: &Inner, repo: &Repository, now: DateTime<Utc>) -> bool {
        let Some(batch_id) = repo.batch_id else {
            return true;
        };
        match inner.batches.get(&batch_id) {
            Some(batch) => {
                batch.state != BatchState::Draft
                    && batch.scheduled_at.map(|at| at <= now).unwrap_or(true)
            }
            None => false,
        }
    }

    fn claim_eligible(repo: &Repository, ctx: &ClaimContext) -> bool {
        if repo.assigned_worker.is_some() {
            return false;
        }
        match state::claim_requirement(repo.state) {
            Some(ClaimRequirement::None) => true,
            Some(ClaimRequirement::DryAttemptsRemaining) => {
                repo.dry_run_attempt_count < ctx.max_dry_run_attempts
            }
            Some(ClaimRequirement::LiveAttemptsRemaining) => {
                repo.live_attempt_count < ctx.max_live_attempts
            }
            Some(ClaimRequirement::MissingDryRunId) => repo.dry_run_migration_id.is_none(),
            Some(ClaimRequirement::MissingLiveId) => repo.live_migration_id.is_none(),
            None => false,
        }
    }

    fn apply_patch(repo: &mut Repository, patch: &TransitionPatch, now: DateTime<Utc>) {
        if let Some(worker) = &patch.assigned_worker {
            repo.assigned_worker = worker.clone();
            repo.claimed_at = worker.as_ref().map(|_| now);
        }
        if let Some(reason) = &patch.failure_reason {
            repo.failure_reason = reason.clone();
        }
        if let Some(name) = &patch.destination_full_name {
            repo.destination_full_name = Some(name.clone());
        }
        if let Some(visibility) = patch.visibility {
            repo.visibility = visibility;
        }
        if let Some(id) = &patch.dry_run_migration_id {
            repo.dry_run_migration_id = id.clone();
        }
        if let Some(id) = &patch.live_migration_id {
            repo.live_migration_id = id.clone();
        }
        if patch.reset_attempts {
            repo.dry_run_attempt_count = 0;
            repo.live_attempt_count = 0;
        } else {
            if patch.increment_dry_attempts {
                repo.dry_run_attempt_count += 1;
            }
            if patch.increment_live_attempts {
                repo.live_attempt_count += 1;
            }
        }
        repo.updated_at = now;
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_repository(&self, new: NewRepository) -> StoreResult<Repository> {
        let now = Utc::now();
        let repo = Repository {
            id: Uuid::new_v4(),
            full_name: new.full_name,
            source_url: new.source_url,
            visibility: new.visibility,
            size_bytes: new.size_bytes,
            complexity_score: new.complexity_score,
            state: RepoState::Pending,
            priority: new.priority,
            assigned_worker: None,
            claimed_at: None,
            last_transition_at: now,
            failure_reason: None,
            batch_id: new.batch_id,
            destination_full_name: None,
            dry_run_migration_id: None,
            live_migration_id: None,
            dry_run_attempt_count: 0,
            live_attempt_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .lock()
            .unwrap()
            .repositories
            .insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn snapshot(&self, id: Uuid) -> StoreResult<Repository> {
        self.inner
            .lock()
            .unwrap()
            .repositories
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("repository", id))
    }

    async fn list_repositories(
        &self,
        states: &[RepoState],
        limit: i64,
    ) -> StoreResult<Vec<Repository>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Repository> = inner
            .repositories
            .values()
            .filter(|r| states.is_empty() || states.contains(&r.state))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.priority, a.last_transition_at, a.id).cmp(&(b.priority, b.last_transition_at, b.id))
        });
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        ctx: &ClaimContext,
    ) -> StoreResult<Option<Repository>> {
        let mut inner = self.inner.lock().unwrap();
        let mut candidates: Vec<Uuid> = Vec::new();
        for repo in inner.repositories.values() {
            if !Self::claim_eligible(repo, ctx) {
                continue;
            }
            if let Some(batch_id) = ctx.batch_id {
                if repo.batch_id != Some(batch_id) {
                    continue;
                }
            }
            if !Self::batch_gate_open(&inner, repo, ctx.now) {
                continue;
            }
            candidates.push(repo.id);
        }
        candidates.sort_by_key(|id| {
            let r = &inner.repositories[id];
            (r.priority, r.last_transition_at, r.id)
        });
        let Some(id) = candidates.first().copied() else {
            return Ok(None);
        };
        let now = Utc::now();
        let repo = inner.repositories.get_mut(&id).unwrap();
        repo.assigned_worker = Some(worker_id.to_string());
        repo.claimed_at = Some(now);
        repo.updated_at = now;
        Ok(Some(repo.clone()))
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: RepoState,
        new: RepoState,
        patch: TransitionPatch,
    ) -> StoreResult<bool> {
        if expected != new && !state::edge_allowed(expected, new) {
            return Err(StoreError::InvalidTransition { from: expected, to: new });
        }
        let mut inner = self.inner.lock().unwrap();
        let repo = inner
            .repositories
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("repository", id))?;
        if repo.state != expected {
            return Ok(false);
        }
        let now = Utc::now();
        repo.state = new;
        if expected != new {
            repo.last_transition_at = now;
        }
        Self::apply_patch(repo, &patch, now);
        Ok(true)
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let repo = inner
            .repositories
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("repository", id))?;
        if repo.assigned_worker.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        repo.assigned_worker = None;
        repo.claimed_at = None;
        repo.updated_at = Utc::now();
        Ok(true)
    }

    async fn clear_stale_claims(&self, older_than: Duration) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - older_than;
        let mut cleared = 0u64;
        for repo in inner.repositories.values_mut() {
            if repo.assigned_worker.is_some() && repo.claimed_at.map(|c| c < cutoff).unwrap_or(true)
            {
                repo.assigned_worker = None;
                repo.claimed_at = None;
                repo.updated_at = Utc::now();
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn enumerate_for_status_poll(&self, limit: i64) -> StoreResult<Vec<Repository>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Repository> = inner
            .repositories
            .values()
            .filter(|r| r.assigned_worker.is_none())
            .filter(|r| match r.state.poll_kind() {
                Some(MigrationKind::DryRun) => r.dry_run_migration_id.is_some(),
                Some(MigrationKind::Live) => r.live_migration_id.is_some(),
                None => false,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.last_transition_at, a.id).cmp(&(b.last_transition_at, b.id))
        });
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> StoreResult<MigrationAttempt> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for existing in inner.attempts.iter_mut() {
            if existing.repository_id == attempt.repository_id
                && existing.kind == attempt.kind
                && existing.outcome == AttemptOutcome::InFlight
            {
                existing.outcome = AttemptOutcome::Superseded;
                existing.finished_at = Some(now);
            }
        }
        let row = MigrationAttempt {
            id: Uuid::new_v4(),
            repository_id: attempt.repository_id,
            kind: attempt.kind,
            external_migration_id: attempt.external_migration_id,
            submitted_at: now,
            finished_at: None,
            outcome: AttemptOutcome::InFlight,
            stderr_excerpt: None,
        };
        inner.attempts.push(row.clone());
        Ok(row)
    }

    async fn finish_attempt(
        &self,
        repository_id: Uuid,
        kind: MigrationKind,
        external_migration_id: &str,
        outcome: AttemptOutcome,
        stderr_excerpt: Option<String>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        for attempt in inner.attempts.iter_mut() {
            if attempt.repository_id == repository_id
                && attempt.kind == kind
                && attempt.external_migration_id == external_migration_id
                && attempt.outcome == AttemptOutcome::InFlight
            {
                attempt.outcome = outcome;
                attempt.finished_at = Some(Utc::now());
                attempt.stderr_excerpt = stderr_excerpt;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn attempts_for(&self, repository_id: Uuid) -> StoreResult<Vec<MigrationAttempt>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.repository_id == repository_id)
            .cloned()
            .collect())
    }

    async fn get_settings(&self) -> StoreResult<Settings> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .settings
            .clone()
            .unwrap_or_default())
    }

    async fn update_settings(&self, settings: &Settings) -> StoreResult<()> {
        self.inner.lock().unwrap().settings = Some(settings.clone());
        Ok(())
    }

    async fn create_batch(
        &self,
        name: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Batch> {
        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            name: name.to_string(),
            state: BatchState::Draft,
            scheduled_at,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .lock()
            .unwrap()
            .batches
            .insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Batch> {
        self.inner
            .lock()
            .unwrap()
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("batch", id))
    }

    async fn set_batch_state(&self, id: Uuid, new: BatchState) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.batches.get_mut(&id) {
            Some(batch) => {
                batch.state = new;
                batch.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn assign_to_batch(&self, repository_id: Uuid, batch_id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.batches.contains_key(&batch_id) {
            return Ok(false);
        }
        match inner.repositories.get_mut(&repository_id) {
            Some(repo) => {
                repo.batch_id = Some(batch_id);
                repo.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn refresh_batches(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut member_states: HashMap<Uuid, Vec<RepoState>> = HashMap::new();
        for repo in inner.repositories.values() {
            if let Some(batch_id) = repo.batch_id {
                member_states.entry(batch_id).or_default().push(repo.state);
            }
        }
        let now = Utc::now();
        for batch in inner.batches.values_mut() {
            let Some(states) = member_states.get(&batch.id) else {
                continue;
            };
            match batch.state {
                BatchState::Ready | BatchState::Running => {
                    if states.iter().all(|s| s.is_terminal()) {
                        batch.state = BatchState::Finished;
                        batch.updated_at = now;
                    } else if batch.state == BatchState::Ready
                        && states.iter().any(|s| *s != RepoState::Pending)
                    {
                        batch.state = BatchState::Running;
                        batch.updated_at = now;
                    }
                }
                BatchState::Draft | BatchState::Finished => {}
            }
        }
        Ok(())
    }
}
