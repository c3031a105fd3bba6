//! The Store port: durable, transactional access to repositories, batches,
//! settings, and the migration-attempt audit log.
//!
//! The contract every implementation must honor:
//!   - `transition` is a single conditional update keyed on (id, expected
//!     state); it returns `false` instead of writing when the expectation no
//!     longer holds.
//!   - `claim_next` atomically stamps `assigned_worker` on at most one
//!     eligible row; two concurrent callers can never claim the same row.
//!   - Transient failures never leave partial writes.

use super::error::StoreResult;
use super::models::{
    AttemptOutcome, Batch, BatchState, MigrationAttempt, MigrationKind, NewAttempt, NewRepository,
    RepoState, Repository, Settings, Visibility,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Field updates applied together with a conditional state change.
///
/// `Some(None)` on an optional column clears it; `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub assigned_worker: Option<Option<String>>,
    pub failure_reason: Option<Option<String>>,
    pub destination_full_name: Option<String>,
    /// Refresh the recorded source visibility after a resolve.
    pub visibility: Option<Visibility>,
    pub dry_run_migration_id: Option<Option<String>>,
    pub live_migration_id: Option<Option<String>>,
    pub increment_dry_attempts: bool,
    pub increment_live_attempts: bool,
    pub reset_attempts: bool,
}

impl TransitionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear worker ownership as part of the transition.
    pub fn release(mut self) -> Self {
        self.assigned_worker = Some(None);
        self
    }

    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(Some(reason.into()));
        self
    }

    pub fn clear_failure(mut self) -> Self {
        self.failure_reason = Some(None);
        self
    }

    pub fn destination(mut self, name: impl Into<String>) -> Self {
        self.destination_full_name = Some(name.into());
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn dry_run_migration_id(mut self, id: impl Into<String>) -> Self {
        self.dry_run_migration_id = Some(Some(id.into()));
        self
    }

    pub fn clear_dry_run_migration_id(mut self) -> Self {
        self.dry_run_migration_id = Some(None);
        self
    }

    pub fn live_migration_id(mut self, id: impl Into<String>) -> Self {
        self.live_migration_id = Some(Some(id.into()));
        self
    }

    pub fn clear_live_migration_id(mut self) -> Self {
        self.live_migration_id = Some(None);
        self
    }

    pub fn increment_attempts(mut self, kind: MigrationKind) -> Self {
        match kind {
            MigrationKind::DryRun => self.increment_dry_attempts = true,
            MigrationKind::Live => self.increment_live_attempts = true,
        }
        self
    }

    pub fn reset_attempts(mut self) -> Self {
        self.reset_attempts = true;
        self
    }
}

/// Parameters the scheduler passes into a claim.
#[derive(Debug, Clone)]
pub struct ClaimContext {
    pub now: DateTime<Utc>,
    pub max_dry_run_attempts: i32,
    pub max_live_attempts: i32,
    /// Restrict claims to one batch, when requested.
    pub batch_id: Option<Uuid>,
}

impl ClaimContext {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            now: Utc::now(),
            max_dry_run_attempts: settings.retry.max_dry_run_attempts,
            max_live_attempts: settings.retry.max_live_attempts,
            batch_id: None,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ---- repositories ----

    async fn insert_repository(&self, repo: NewRepository) -> StoreResult<Repository>;

    /// Read-only snapshot for observers.
    async fn snapshot(&self, id: Uuid) -> StoreResult<Repository>;

    async fn list_repositories(
        &self,
        states: &[RepoState],
        limit: i64,
    ) -> StoreResult<Vec<Repository>>;

    /// Atomically claim at most one eligible repository for `worker_id`,
    /// ordered by (priority, last_transition_at, id) ascending. Eligibility
    /// is defined by [`super::state::claim_requirement`] plus batch gating.
    async fn claim_next(
        &self,
        worker_id: &str,
        ctx: &ClaimContext,
    ) -> StoreResult<Option<Repository>>;

    /// Conditional state update. Returns `false` without writing when the
    /// row is not in `expected`. `expected == new` applies a patch without
    /// changing the state (used for persisting external identifiers).
    async fn transition(
        &self,
        id: Uuid,
        expected: RepoState,
        new: RepoState,
        patch: TransitionPatch,
    ) -> StoreResult<bool>;

    /// Clear ownership without a state change, if `worker_id` still owns the
    /// row.
    async fn release(&self, id: Uuid, worker_id: &str) -> StoreResult<bool>;

    /// Clear `assigned_worker` stamps older than `older_than`. Returns the
    /// number of rows recovered.
    async fn clear_stale_claims(&self, older_than: Duration) -> StoreResult<u64>;

    /// Rows waiting on an external migration: poll-owned states with the
    /// matching external id present and no assigned worker.
    async fn enumerate_for_status_poll(&self, limit: i64) -> StoreResult<Vec<Repository>>;

    // ---- migration attempts ----

    /// Append an audit row for a started external migration. Any still
    /// in-flight attempt of the same (repository, kind) is marked
    /// `superseded` so at most one is ever in flight.
    async fn record_attempt(&self, attempt: NewAttempt) -> StoreResult<MigrationAttempt>;

    /// Finish the in-flight attempt matching (repository, kind, external id).
    async fn finish_attempt(
        &self,
        repository_id: Uuid,
        kind: MigrationKind,
        external_migration_id: &str,
        outcome: AttemptOutcome,
        stderr_excerpt: Option<String>,
    ) -> StoreResult<bool>;

    async fn attempts_for(&self, repository_id: Uuid) -> StoreResult<Vec<MigrationAttempt>>;

    // ---- settings ----

    /// Returns defaults when no settings row has been written yet.
    async fn get_settings(&self) -> StoreResult<Settings>;

    async fn update_settings(&self, settings: &Settings) -> StoreResult<()>;

    // ---- batches ----

    async fn create_batch(
        &self,
        name: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Batch>;

    async fn get_batch(&self, id: Uuid) -> StoreResult<Batch>;

    async fn set_batch_state(&self, id: Uuid, state: BatchState) -> StoreResult<bool>;

    async fn assign_to_batch(&self, repository_id: Uuid, batch_id: Uuid) -> StoreResult<bool>;

    /// Recompute batch states: `running` once any member left `pending`,
    /// `finished` when every member is terminal.
    async fn refresh_batches(&self) -> StoreResult<()>;
}
