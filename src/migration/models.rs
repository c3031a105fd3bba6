use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a repository moving through the migration pipeline.
///
/// The allowed transitions are encoded in [`super::state`]; every state
/// change goes through a conditional update so concurrent writers cannot
/// produce an invalid walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoState {
    Pending,
    RemediationRequired,
    DryRunQueued,
    DryRunInProgress,
    DryRunComplete,
    DryRunFailed,
    PreMigration,
    ArchiveGenerating,
    QueuedForMigration,
    MigratingContent,
    PostMigration,
    MigrationFailed,
    MigrationComplete,
    Complete,
    WontMigrate,
    RolledBack,
}

impl RepoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoState::Pending => "pending",
            RepoState::RemediationRequired => "remediation_required",
            RepoState::DryRunQueued => "dry_run_queued",
            RepoState::DryRunInProgress => "dry_run_in_progress",
            RepoState::DryRunComplete => "dry_run_complete",
            RepoState::DryRunFailed => "dry_run_failed",
            RepoState::PreMigration => "pre_migration",
            RepoState::ArchiveGenerating => "archive_generating",
            RepoState::QueuedForMigration => "queued_for_migration",
            RepoState::MigratingContent => "migrating_content",
            RepoState::PostMigration => "post_migration",
            RepoState::MigrationFailed => "migration_failed",
            RepoState::MigrationComplete => "migration_complete",
            RepoState::Complete => "complete",
            RepoState::WontMigrate => "wont_migrate",
            RepoState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RepoState::Pending),
            "remediation_required" => Ok(RepoState::RemediationRequired),
            "dry_run_queued" => Ok(RepoState::DryRunQueued),
            "dry_run_in_progress" => Ok(RepoState::DryRunInProgress),
            "dry_run_complete" => Ok(RepoState::DryRunComplete),
            "dry_run_failed" => Ok(RepoState::DryRunFailed),
            "pre_migration" => Ok(RepoState::PreMigration),
            "archive_generating" => Ok(RepoState::ArchiveGenerating),
            "queued_for_migration" => Ok(RepoState::QueuedForMigration),
            "migrating_content" => Ok(RepoState::MigratingContent),
            "post_migration" => Ok(RepoState::PostMigration),
            "migration_failed" => Ok(RepoState::MigrationFailed),
            "migration_complete" => Ok(RepoState::MigrationComplete),
            "complete" => Ok(RepoState::Complete),
            "wont_migrate" => Ok(RepoState::WontMigrate),
            "rolled_back" => Ok(RepoState::RolledBack),
            _ => Err(format!("Invalid repository state: {s}")),
        }
    }
}

/// Repository visibility on either side of the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Internal,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Visibility::Public => "public",
            Visibility::Internal => "internal",
            Visibility::Private => "private",
        };
        f.write_str(s)
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "internal" => Ok(Visibility::Internal),
            "private" => Ok(Visibility::Private),
            _ => Err(format!("Invalid visibility: {s}")),
        }
    }
}

/// What to do when the destination repository name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Accept the existing repository and continue.
    Skip,
    /// Treat the collision as a permanent error.
    Fail,
    /// Suffix the name with `-1`, `-2`, ... until a free slot is found.
    Rename,
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(CollisionPolicy::Skip),
            "fail" => Ok(CollisionPolicy::Fail),
            "rename" => Ok(CollisionPolicy::Rename),
            _ => Err(format!("Invalid collision policy: {s}")),
        }
    }
}

/// Dry-run vs live migration, the two external operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    DryRun,
    Live,
}

impl MigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::DryRun => "dry_run",
            MigrationKind::Live => "live",
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dry_run" => Ok(MigrationKind::DryRun),
            "live" => Ok(MigrationKind::Live),
            _ => Err(format!("Invalid migration kind: {s}")),
        }
    }
}

/// Outcome recorded on a migration attempt audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    InFlight,
    Succeeded,
    Failed,
    /// A newer attempt of the same kind replaced this one before it finished.
    Superseded,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::InFlight => "in_flight",
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Superseded => "superseded",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(AttemptOutcome::InFlight),
            "succeeded" => Ok(AttemptOutcome::Succeeded),
            "failed" => Ok(AttemptOutcome::Failed),
            "superseded" => Ok(AttemptOutcome::Superseded),
            _ => Err(format!("Invalid attempt outcome: {s}")),
        }
    }
}

/// A repository row as held by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    /// Canonical source identifier, e.g. `acme/web` or `contoso/Proj/Repo`.
    pub full_name: String,
    pub source_url: String,
    pub visibility: Visibility,
    pub size_bytes: i64,
    pub complexity_score: f32,
    pub state: RepoState,
    /// Dispatch ordering key; lower values are claimed first.
    pub priority: i32,
    /// Identity of the worker currently driving a transition, if any.
    pub assigned_worker: Option<String>,
    /// When `assigned_worker` was stamped; used for stale-claim cleanup.
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub batch_id: Option<Uuid>,
    /// Final destination `name` under the configured organization, once known.
    pub destination_full_name: Option<String>,
    pub dry_run_migration_id: Option<String>,
    pub live_migration_id: Option<String>,
    pub dry_run_attempt_count: i32,
    pub live_attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation request for a repository row, written by discovery or tests.
#[derive(Debug, Clone)]
pub struct NewRepository {
    pub full_name: String,
    pub source_url: String,
    pub visibility: Visibility,
    pub size_bytes: i64,
    pub complexity_score: f32,
    pub priority: i32,
    pub batch_id: Option<Uuid>,
}

impl NewRepository {
    pub fn new(full_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            source_url: source_url.into(),
            visibility: Visibility::Private,
            size_bytes: 0,
            complexity_score: 0.0,
            priority: 0,
            batch_id: None,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Draft,
    Ready,
    Running,
    Finished,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Draft => "draft",
            BatchState::Ready => "ready",
            BatchState::Running => "running",
            BatchState::Finished => "finished",
        };
        f.write_str(s)
    }
}

impl FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(BatchState::Draft),
            "ready" => Ok(BatchState::Ready),
            "running" => Ok(BatchState::Running),
            "finished" => Ok(BatchState::Finished),
            _ => Err(format!("Invalid batch state: {s}")),
        }
    }
}

/// A named group of repositories migrated together on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub state: BatchState,
    /// Members are not claimable before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record, one per started external migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationAttempt {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub kind: MigrationKind,
    pub external_migration_id: String,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    pub stderr_excerpt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub repository_id: Uuid,
    pub kind: MigrationKind,
    pub external_migration_id: String,
}

/// Destination credential variant. Exactly one usable variant must be
/// configured before the worker pool will run; `Unconfigured` quiesces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum DestCredentials {
    Unconfigured,
    Token {
        token: String,
    },
    App {
        app_id: String,
        private_key: String,
        installation_id: String,
    },
}

impl DestCredentials {
    pub fn is_configured(&self) -> bool {
        !matches!(self, DestCredentials::Unconfigured)
    }
}

/// Retry and backoff knobs, all hot-reloadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Total budget for one transition, external calls plus sleeps.
    pub budget_seconds: u64,
    pub max_dry_run_attempts: i32,
    pub max_live_attempts: i32,
    /// Claims older than this are considered abandoned and cleared.
    pub stale_claim_seconds: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 60_000,
            budget_seconds: 900,
            max_dry_run_attempts: 3,
            max_live_attempts: 3,
            stale_claim_seconds: 600,
        }
    }
}

/// The dynamic settings record. A single logical row, mutated only through
/// the administrative surface, reloaded into every component via
/// [`super::dynamic_config::DynamicConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Destination API base URL, e.g. `https://api.github.com`.
    pub destination_base_url: String,
    /// Destination organization receiving migrated repositories.
    pub destination_org: String,
    pub credentials: DestCredentials,
    /// Personal token for the source forge, when archive export needs one.
    pub source_token: Option<String>,
    pub worker_count: usize,
    pub poll_interval_seconds: u64,
    pub on_exists: CollisionPolicy,
    /// Destination visibility for repositories that are public at the source.
    pub visibility_public: Visibility,
    /// Destination visibility for repositories that are internal at the source.
    pub visibility_internal: Visibility,
    pub retry: RetrySettings,
    pub auth_enabled: bool,
    pub session_duration_minutes: u64,
    pub session_secret: String,
    pub oauth_callback_url: String,
    pub frontend_origin: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            destination_base_url: "https://api.github.com".to_string(),
            destination_org: String::new(),
            credentials: DestCredentials::Unconfigured,
            source_token: None,
            worker_count: 4,
            poll_interval_seconds: 30,
            on_exists: CollisionPolicy::Fail,
            visibility_public: Visibility::Internal,
            visibility_internal: Visibility::Internal,
            retry: RetrySettings::default(),
            auth_enabled: false,
            session_duration_minutes: 480,
            session_secret: String::new(),
            oauth_callback_url: String::new(),
            frontend_origin: String::new(),
        }
    }
}

impl Settings {
    /// Structural validation. Credential presence is deliberately not checked
    /// here: `Unconfigured` credentials are storable and quiesce the pool
    /// instead of failing the reload.
    pub fn validate(&self) -> Result<(), String> {
        if self.destination_base_url.is_empty() {
            return Err("Destination base URL is required".to_string());
        }
        if self.worker_count < 1 {
            return Err("Worker count must be at least 1".to_string());
        }
        if self.poll_interval_seconds < 1 {
            return Err("Poll interval must be at least 1 second".to_string());
        }
        if self.retry.budget_seconds == 0 {
            return Err("Retry budget must be greater than 0".to_string());
        }
        if self.retry.max_dry_run_attempts < 1 || self.retry.max_live_attempts < 1 {
            return Err("Attempt maximums must be at least 1".to_string());
        }
        if self.retry.factor < 1.0 {
            return Err("Backoff factor must be at least 1.0".to_string());
        }
        Ok(())
    }

    /// Map a source visibility to the configured destination visibility.
    pub fn map_visibility(&self, source: Visibility) -> Visibility {
        match source {
            Visibility::Public => self.visibility_public,
            Visibility::Internal => self.visibility_internal,
            Visibility::Private => Visibility::Private,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_state_round_trip() {
        for s in [
            RepoState::Pending,
            RepoState::DryRunInProgress,
            RepoState::QueuedForMigration,
            RepoState::RolledBack,
        ] {
            assert_eq!(s.as_str().parse::<RepoState>().unwrap(), s);
        }
        assert!("bogus".parse::<RepoState>().is_err());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.worker_count = 0;
        assert!(settings.validate().is_err());

        settings.worker_count = 2;
        settings.poll_interval_seconds = 0;
        assert!(settings.validate().is_err());

        settings.poll_interval_seconds = 5;
        settings.retry.max_live_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_visibility_mapping() {
        let mut settings = Settings::default();
        settings.visibility_public = Visibility::Private;
        assert_eq!(settings.map_visibility(Visibility::Public), Visibility::Private);
        assert_eq!(settings.map_visibility(Visibility::Private), Visibility::Private);
        assert_eq!(
            settings.map_visibility(Visibility::Internal),
            Visibility::Internal
        );
    }

    #[test]
    fn test_credentials_configured() {
        assert!(!DestCredentials::Unconfigured.is_configured());
        assert!(DestCredentials::Token {
            token: "ghp_x".to_string()
        }
        .is_configured());
    }
}
