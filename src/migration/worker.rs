//! MigrationWorker: drives exactly one repository at a time through a single
//! state transition, end to end.
//!
//! A worker owns a claimed row (its identity is stamped in
//! `assigned_worker`) until it finishes the transition. Every external side
//! effect is preceded by a check for an already-persisted identifier, so a
//! crashed-and-restarted worker never double-starts a migration.

use super::dynamic_config::DynamicConfig;
use super::error::{MigrationError, Result, StoreResult};
use super::manager::{CoreEvent, ManagerSignal};
use super::models::{
    CollisionPolicy, MigrationKind, NewAttempt, RepoState, Repository, Settings, Visibility,
};
use super::retry::{RetryConfig, RetryPolicy};
use super::store::{Store, TransitionPatch};
use crate::forge::url::parse_source_url;
use crate::forge::{ForgeError, ForgeHolder, ResolvedTarget};
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Retry transient store failures for a bounded window; anything else
/// propagates immediately.
pub(crate) async fn with_store_retry<T, F, Fut>(operation: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let backoff = ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    backoff::future::retry(backoff, || async {
        operation().await.map_err(|e| {
            if e.is_transient() {
                warn!("transient store error, backing off: {e}");
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}

struct StartedExternal {
    external_id: String,
    target: ResolvedTarget,
    source_visibility: Visibility,
}

pub struct MigrationWorker {
    id: String,
    store: Arc<dyn Store>,
    config: Arc<DynamicConfig>,
    forges: Arc<ForgeHolder>,
    events: broadcast::Sender<CoreEvent>,
    signals: mpsc::UnboundedSender<ManagerSignal>,
}

impl MigrationWorker {
    pub fn new(
        id: String,
        store: Arc<dyn Store>,
        config: Arc<DynamicConfig>,
        forges: Arc<ForgeHolder>,
        events: broadcast::Sender<CoreEvent>,
        signals: mpsc::UnboundedSender<ManagerSignal>,
    ) -> Self {
        Self {
            id,
            store,
            config,
            forges,
            events,
            signals,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Execute the transition for a claimed repository. Errors are absorbed
    /// here: a failed transition leaves the row for the stale-claim janitor
    /// or the next dispatch, and fatal store errors are escalated to the
    /// manager.
    pub async fn process(&self, repo: Repository) {
        let repo_id = repo.id;
        let claimed_state = repo.state;
        debug!(
            worker = %self.id,
            repository = %repo_id,
            state = %claimed_state,
            "processing claimed repository"
        );
        if let Err(e) = self.execute(repo).await {
            match &e {
                MigrationError::Store(store_error) if store_error.is_fatal() => {
                    error!(repository = %repo_id, "fatal store error in worker: {e}");
                    let _ = self
                        .signals
                        .send(ManagerSignal::StoreFatal(store_error.to_string()));
                }
                _ => {
                    warn!(
                        worker = %self.id,
                        repository = %repo_id,
                        state = %claimed_state,
                        "transition aborted: {e}"
                    );
                }
            }
        }
    }

    async fn execute(&self, repo: Repository) -> Result<()> {
        let settings = self.config.snapshot().await;
        match repo.state {
            RepoState::Pending => self.gate(&repo, RepoState::DryRunQueued).await,
            RepoState::DryRunQueued => {
                let Some(repo) = self.begin(&repo, RepoState::DryRunInProgress).await? else {
                    return Ok(());
                };
                self.start_external(&repo, MigrationKind::DryRun, &settings)
                    .await
            }
            // Crash resume: claimed only while no dry-run id is persisted.
            RepoState::DryRunInProgress => {
                self.start_external(&repo, MigrationKind::DryRun, &settings)
                    .await
            }
            RepoState::DryRunFailed => {
                let patch = TransitionPatch::new()
                    .clear_dry_run_migration_id()
                    .clear_failure();
                let Some(repo) = self
                    .step(&repo, RepoState::DryRunFailed, RepoState::DryRunQueued, patch)
                    .await?
                else {
                    return Ok(());
                };
                let Some(repo) = self.begin(&repo, RepoState::DryRunInProgress).await? else {
                    return Ok(());
                };
                self.start_external(&repo, MigrationKind::DryRun, &settings)
                    .await
            }
            RepoState::DryRunComplete => self.gate(&repo, RepoState::PreMigration).await,
            RepoState::PreMigration => {
                self.start_external(&repo, MigrationKind::Live, &settings)
                    .await
            }
            // Crash resume: claimed only while no live id is persisted.
            RepoState::ArchiveGenerating | RepoState::QueuedForMigration => {
                self.start_external(&repo, MigrationKind::Live, &settings)
                    .await
            }
            RepoState::MigrationFailed => {
                let patch = TransitionPatch::new()
                    .clear_live_migration_id()
                    .clear_failure();
                let Some(repo) = self
                    .step(
                        &repo,
                        RepoState::MigrationFailed,
                        RepoState::QueuedForMigration,
                        patch,
                    )
                    .await?
                else {
                    return Ok(());
                };
                self.start_external(&repo, MigrationKind::Live, &settings)
                    .await
            }
            RepoState::PostMigration => self.post_migration(&repo, &settings).await,
            RepoState::MigrationComplete => self.gate(&repo, RepoState::Complete).await,
            other => {
                // Bug-class: the dispatcher handed us a state it should
                // never claim.
                error!(
                    worker = %self.id,
                    repository = %repo.id,
                    state = %other,
                    "claimed repository in unexpected state"
                );
                self.release_slot(&repo).await
            }
        }
    }

    /// A deterministic transition with no external call, releasing the slot.
    async fn gate(&self, repo: &Repository, to: RepoState) -> Result<()> {
        if !self
            .transition(repo, repo.state, to, TransitionPatch::new().release())
            .await?
        {
            return self.surrender(repo).await;
        }
        Ok(())
    }

    /// Move a queued state into its in-progress state, keeping ownership.
    async fn begin(&self, repo: &Repository, to: RepoState) -> Result<Option<Repository>> {
        self.step(repo, repo.state, to, TransitionPatch::new()).await
    }

    /// Perform an intermediate transition and return the refreshed row, or
    /// `None` when ownership was lost.
    async fn step(
        &self,
        repo: &Repository,
        expected: RepoState,
        to: RepoState,
        patch: TransitionPatch,
    ) -> Result<Option<Repository>> {
        if !self.transition(repo, expected, to, patch).await? {
            self.surrender(repo).await?;
            return Ok(None);
        }
        let store = &self.store;
        let refreshed = with_store_retry(|| store.snapshot(repo.id)).await?;
        Ok(Some(refreshed))
    }

    /// Start the external migration of `kind`, persisting the identifiers in
    /// one conditional update that also releases the slot.
    async fn start_external(
        &self,
        repo: &Repository,
        kind: MigrationKind,
        settings: &Settings,
    ) -> Result<()> {
        let existing = match kind {
            MigrationKind::DryRun => &repo.dry_run_migration_id,
            MigrationKind::Live => &repo.live_migration_id,
        };
        if existing.is_some() {
            // Already started by a previous incarnation; the poll loop owns
            // it from here.
            debug!(repository = %repo.id, %kind, "external migration already in flight");
            return self.release_slot(repo).await;
        }

        if !settings.credentials.is_configured() {
            return self
                .auth_pause(repo, "destination credentials are not configured")
                .await;
        }

        let forges = self.forges.current().await;
        let policy = RetryPolicy::new(RetryConfig::from_settings(&settings.retry));

        let started: std::result::Result<StartedExternal, ForgeError> = async {
            let source = policy
                .run("resolve_repo", || forges.source.resolve_repo(&repo.source_url))
                .await?;

            let (desired, collision_policy) = match &repo.destination_full_name {
                // A name we already resolved is ours; re-ensuring it must
                // not trip the collision policy again.
                Some(name) => (name.clone(), CollisionPolicy::Skip),
                None => (
                    parse_source_url(&repo.source_url)?.default_destination_name(),
                    settings.on_exists,
                ),
            };
            let visibility = settings.map_visibility(source.visibility);
            let target = policy
                .run("ensure_repo", || {
                    forges.dest.ensure_repo(&desired, visibility, collision_policy)
                })
                .await?;
            let archive = policy
                .run("export_archive", || forges.source.export_archive(&source))
                .await?;
            let external_id = policy
                .run("start_migration", || {
                    forges.dest.start_migration(kind, &archive, &target)
                })
                .await?;
            Ok(StartedExternal {
                external_id,
                target,
                source_visibility: source.visibility,
            })
        }
        .await;

        match started {
            Ok(started) => {
                let store = &self.store;
                let attempt = NewAttempt {
                    repository_id: repo.id,
                    kind,
                    external_migration_id: started.external_id.clone(),
                };
                with_store_retry(|| store.record_attempt(attempt.clone())).await?;

                let new_state = match (kind, repo.state) {
                    (MigrationKind::Live, RepoState::PreMigration) => RepoState::ArchiveGenerating,
                    // Same-state patch for the dry run and the resume paths.
                    (_, current) => current,
                };
                let mut patch = TransitionPatch::new()
                    .destination(started.target.name.clone())
                    .visibility(started.source_visibility)
                    .increment_attempts(kind)
                    .release();
                patch = match kind {
                    MigrationKind::DryRun => {
                        patch.dry_run_migration_id(started.external_id.clone())
                    }
                    MigrationKind::Live => patch.live_migration_id(started.external_id.clone()),
                };
                if self.transition(repo, repo.state, new_state, patch).await? {
                    info!(
                        repository = %repo.id,
                        %kind,
                        external_id = %started.external_id,
                        target = %started.target.name,
                        "external migration started"
                    );
                } else {
                    // The row moved underneath us (admin cancel); the started
                    // migration is orphaned, so clean it up best-effort.
                    warn!(
                        repository = %repo.id,
                        external_id = %started.external_id,
                        "row moved after external start; cleaning up"
                    );
                    if let Err(e) = forges.dest.cleanup(&started.external_id).await {
                        debug!("cleanup failed: {e}");
                    }
                    self.surrender(repo).await?;
                }
                Ok(())
            }
            Err(ForgeError::AuthExpired) => {
                self.auth_pause(repo, "destination rejected credentials")
                    .await
            }
            Err(error) => self.fail(repo, error.to_string()).await,
        }
    }

    /// Post-import tasks: visibility adjustment and best-effort restoration
    /// of the preferred name when the collision policy suffixed it. Each
    /// task is idempotent.
    async fn post_migration(&self, repo: &Repository, settings: &Settings) -> Result<()> {
        let forges = self.forges.current().await;
        let policy = RetryPolicy::new(RetryConfig::from_settings(&settings.retry));
        let mut restored_name: Option<String> = None;

        let outcome: std::result::Result<(), ForgeError> = async {
            if let Some(dest_name) = &repo.destination_full_name {
                let visibility = settings.map_visibility(repo.visibility);
                policy
                    .run("set_visibility", || {
                        forges.dest.set_visibility(dest_name, visibility)
                    })
                    .await?;

                if settings.on_exists == CollisionPolicy::Rename {
                    if let Ok(parsed) = parse_source_url(&repo.source_url) {
                        let preferred = parsed.default_destination_name();
                        if *dest_name != preferred {
                            match forges.dest.rename_repo(dest_name, &preferred).await {
                                Ok(()) => {
                                    info!(
                                        repository = %repo.id,
                                        from = %dest_name,
                                        to = %preferred,
                                        "restored preferred destination name"
                                    );
                                    restored_name = Some(preferred);
                                }
                                Err(ForgeError::Conflict { .. }) => {
                                    debug!(
                                        repository = %repo.id,
                                        "preferred name still taken; keeping suffix"
                                    );
                                }
                                Err(e) => {
                                    warn!(
                                        repository = %repo.id,
                                        "name restoration failed, keeping suffix: {e}"
                                    );
                                }
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                let mut patch = TransitionPatch::new().release();
                if let Some(name) = restored_name {
                    patch = patch.destination(name);
                }
                if !self
                    .transition(repo, RepoState::PostMigration, RepoState::MigrationComplete, patch)
                    .await?
                {
                    return self.surrender(repo).await;
                }
                Ok(())
            }
            Err(ForgeError::AuthExpired) => {
                self.auth_pause(repo, "destination rejected credentials")
                    .await
            }
            Err(error) => self.fail(repo, error.to_string()).await,
        }
    }

    /// Record the failure and transition to the corresponding failed state.
    async fn fail(&self, repo: &Repository, reason: String) -> Result<()> {
        let Some(failed) = repo.state.failed_state() else {
            warn!(
                repository = %repo.id,
                state = %repo.state,
                "failure with no failed-state mapping: {reason}"
            );
            return self.release_slot(repo).await;
        };
        warn!(
            repository = %repo.id,
            state = %repo.state,
            to = %failed,
            "transition failed: {reason}"
        );
        if !self
            .transition(
                repo,
                repo.state,
                failed,
                TransitionPatch::new().fail(reason).release(),
            )
            .await?
        {
            return self.surrender(repo).await;
        }
        Ok(())
    }

    /// The forge rejected our credentials: tell the manager to quiesce the
    /// pool and put the row back untouched.
    async fn auth_pause(&self, repo: &Repository, reason: &str) -> Result<()> {
        let _ = self
            .signals
            .send(ManagerSignal::AuthExpired(reason.to_string()));
        self.release_slot(repo).await
    }

    /// Release ownership without a state change.
    async fn release_slot(&self, repo: &Repository) -> Result<()> {
        let store = &self.store;
        let id = repo.id;
        let worker = self.id.clone();
        with_store_retry(|| store.release(id, &worker)).await?;
        Ok(())
    }

    /// A conditional update failed where we believed we held ownership. An
    /// admin cancel is the legitimate cause; anything else is a bug-class
    /// event worth a log line either way.
    async fn surrender(&self, repo: &Repository) -> Result<()> {
        debug!(
            worker = %self.id,
            repository = %repo.id,
            state = %repo.state,
            "conditional update lost; surrendering claim"
        );
        let store = &self.store;
        let id = repo.id;
        let worker = self.id.clone();
        // Best effort: the row may already carry no ownership stamp.
        let _ = with_store_retry(|| store.release(id, &worker)).await;
        Ok(())
    }

    async fn transition(
        &self,
        repo: &Repository,
        expected: RepoState,
        new: RepoState,
        patch: TransitionPatch,
    ) -> Result<bool> {
        let store = &self.store;
        let id = repo.id;
        let applied =
            with_store_retry(|| store.transition(id, expected, new, patch.clone())).await?;
        if applied && expected != new {
            let _ = self.events.send(CoreEvent::Transition {
                repository_id: id,
                from: expected,
                to: new,
                at: Utc::now(),
            });
        }
        Ok(applied)
    }
}
