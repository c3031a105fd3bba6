//! Ports for the source and destination forges.
//!
//! The migration core never talks HTTP directly; it drives these traits.
//! Adapters for GitHub and Azure DevOps live in this module, along with a
//! scriptable in-process mock used by the test suites and `serve --mock`.

pub mod azure_devops;
pub mod github;
pub mod mock;
pub mod url;

use crate::migration::models::{CollisionPolicy, MigrationKind, Settings, Visibility};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Forge failure taxonomy. Callers branch on the class, not the message.
#[derive(Error, Debug, Clone)]
pub enum ForgeError {
    /// Network failure, 5xx, or rate limiting. Retryable; the forge may
    /// supply a retry-after hint that overrides the default backoff.
    #[error("transient forge error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Credentials missing, invalid, or expired. Pauses the worker pool.
    #[error("forge credentials rejected or unconfigured")]
    AuthExpired,

    /// Any non-retryable failure: 4xx other than 429, malformed response.
    #[error("permanent forge error: {message}")]
    Permanent { message: String },

    /// Destination name already taken under the `fail` collision policy.
    #[error("destination repository {name} already exists")]
    Conflict { name: String },

    /// A source URL the core does not recognize.
    #[error("unsupported source url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl ForgeError {
    pub fn transient(message: impl Into<String>) -> Self {
        ForgeError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        ForgeError::Transient {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ForgeError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::Transient { .. })
    }
}

/// A resolved source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSource {
    /// `{owner}/{repo}` for GitHub, `{org}/{project}/{repo}` for Azure DevOps.
    pub canonical_id: String,
    pub canonical_url: String,
    pub visibility: Visibility,
    pub size_bytes: i64,
}

/// Opaque handle to a source archive the destination can consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHandle {
    pub url: String,
}

/// The destination repository actually used, after collision resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedTarget {
    /// Repository name under the destination organization.
    pub name: String,
    /// Whether the collision policy suffixed the requested name.
    pub renamed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Running,
    Succeeded,
    Failed,
}

/// Coarse progress phase reported while a live migration is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    PreparingArchive,
    Queued,
    Migrating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPoll {
    pub status: MigrationStatus,
    pub phase: Option<MigrationPhase>,
    pub failure_reason: Option<String>,
}

impl MigrationPoll {
    pub fn running(phase: MigrationPhase) -> Self {
        Self {
            status: MigrationStatus::Running,
            phase: Some(phase),
            failure_reason: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            status: MigrationStatus::Succeeded,
            phase: None,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: MigrationStatus::Failed,
            phase: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Source-side forge operations.
#[async_trait]
pub trait SourceForge: Send + Sync {
    /// Resolve a raw source URL to its canonical identity and metadata.
    async fn resolve_repo(&self, url: &str) -> Result<ResolvedSource, ForgeError>;

    /// Begin generating a migration archive for the repository.
    async fn export_archive(&self, source: &ResolvedSource) -> Result<ArchiveHandle, ForgeError>;
}

/// Destination-side forge operations.
#[async_trait]
pub trait DestForge: Send + Sync {
    /// Ensure the destination repository exists, applying the collision
    /// policy when the requested name is taken.
    async fn ensure_repo(
        &self,
        name: &str,
        visibility: Visibility,
        on_collision: CollisionPolicy,
    ) -> Result<ResolvedTarget, ForgeError>;

    async fn start_migration(
        &self,
        kind: MigrationKind,
        archive: &ArchiveHandle,
        target: &ResolvedTarget,
    ) -> Result<String, ForgeError>;

    async fn poll_migration(&self, external_id: &str) -> Result<MigrationPoll, ForgeError>;

    /// Best-effort archive/staging cleanup. Failures are logged by callers,
    /// never propagated.
    async fn cleanup(&self, external_id: &str) -> Result<(), ForgeError>;

    async fn set_visibility(&self, name: &str, visibility: Visibility) -> Result<(), ForgeError>;

    /// Rename a destination repository. Returns `Conflict` if the new name
    /// is taken.
    async fn rename_repo(&self, name: &str, new_name: &str) -> Result<(), ForgeError>;
}

/// A matched pair of forge clients built from one settings snapshot.
#[derive(Clone)]
pub struct ForgeSet {
    pub source: Arc<dyn SourceForge>,
    pub dest: Arc<dyn DestForge>,
}

/// Builds forge clients from a settings snapshot. The manager rebuilds the
/// set whenever a reload changes destination credentials or the base URL.
pub trait ForgeFactory: Send + Sync {
    fn build(&self, settings: &Settings) -> Result<ForgeSet, ForgeError>;
}

/// Holds the current forge set. Workers fetch it per transition and never
/// cache it across transitions.
pub struct ForgeHolder {
    inner: tokio::sync::RwLock<Arc<ForgeSet>>,
}

impl ForgeHolder {
    pub fn new(set: ForgeSet) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(Arc::new(set)),
        }
    }

    pub async fn current(&self) -> Arc<ForgeSet> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, set: ForgeSet) {
        *self.inner.write().await = Arc::new(set);
    }
}

/// Candidate names under the `rename` collision policy: `base-1`, `base-2`, ...
pub fn rename_candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    (1u32..).map(move |n| format!("{base}-{n}"))
}

/// Build the default forge set from settings: a GitHub destination client
/// plus a source router that dispatches on the URL shape.
pub struct RestForgeFactory;

impl ForgeFactory for RestForgeFactory {
    fn build(&self, settings: &Settings) -> Result<ForgeSet, ForgeError> {
        let dest = Arc::new(github::GithubForge::for_destination(settings)?);
        let source = Arc::new(SourceRouter {
            github: github::GithubForge::for_source(settings)?,
            azure_devops: azure_devops::AzureDevOpsForge::new(settings)?,
        });
        Ok(ForgeSet { source, dest })
    }
}

/// Routes source operations to the right adapter by URL shape.
pub struct SourceRouter {
    github: github::GithubForge,
    azure_devops: azure_devops::AzureDevOpsForge,
}

#[async_trait]
impl SourceForge for SourceRouter {
    async fn resolve_repo(&self, raw: &str) -> Result<ResolvedSource, ForgeError> {
        match url::parse_source_url(raw)?.kind {
            url::SourceKind::AzureDevOps => self.azure_devops.resolve_repo(raw).await,
            _ => self.github.resolve_repo(raw).await,
        }
    }

    async fn export_archive(&self, source: &ResolvedSource) -> Result<ArchiveHandle, ForgeError> {
        match url::parse_source_url(&source.canonical_url)?.kind {
            url::SourceKind::AzureDevOps => self.azure_devops.export_archive(source).await,
            _ => self.github.export_archive(source).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_candidates_sequence() {
        let names: Vec<String> = rename_candidates("acme-web").take(3).collect();
        assert_eq!(names, vec!["acme-web-1", "acme-web-2", "acme-web-3"]);
    }

    #[test]
    fn test_error_classification() {
        assert!(ForgeError::transient("timeout").is_transient());
        assert!(!ForgeError::AuthExpired.is_transient());
        assert!(!ForgeError::permanent("404").is_transient());
    }
}
