//! GitHub forge adapter, used for GitHub Cloud and GitHub Enterprise Server
//! on the source side and for the destination organization.
//!
//! Destination authentication is either a personal token or a GitHub App
//! (App JWT exchanged for a cached installation token).

use super::url::{parse_source_url, SourceKind};
use super::{
    rename_candidates, ArchiveHandle, DestForge, ForgeError, MigrationPhase, MigrationPoll,
    ResolvedSource, ResolvedTarget, SourceForge,
};
use crate::migration::models::{
    CollisionPolicy, DestCredentials, MigrationKind, Settings, Visibility,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const USER_AGENT: &str = "repo-migrator";
/// Upper bound on rename probing so a pathological destination cannot spin.
const MAX_RENAME_CANDIDATES: usize = 50;

#[derive(Debug, Clone)]
enum AuthMode {
    /// Unauthenticated; only works against public source repositories.
    Anonymous,
    Token(String),
    App {
        app_id: String,
        private_key: String,
        installation_id: String,
    },
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct GithubForge {
    http: Client,
    /// API base for destination operations, e.g. `https://api.github.com`.
    api_base: String,
    org: String,
    auth: AuthMode,
    installation_token: Mutex<Option<CachedToken>>,
}

impl GithubForge {
    fn client() -> Result<Client, ForgeError> {
        Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ForgeError::permanent(format!("failed to build HTTP client: {e}")))
    }

    /// Destination-side client bound to the configured organization.
    pub fn for_destination(settings: &Settings) -> Result<Self, ForgeError> {
        let auth = match &settings.credentials {
            DestCredentials::Unconfigured => AuthMode::Anonymous,
            DestCredentials::Token { token } => AuthMode::Token(token.clone()),
            DestCredentials::App {
                app_id,
                private_key,
                installation_id,
            } => AuthMode::App {
                app_id: app_id.clone(),
                private_key: private_key.clone(),
                installation_id: installation_id.clone(),
            },
        };
        Ok(Self {
            http: Self::client()?,
            api_base: settings.destination_base_url.trim_end_matches('/').to_string(),
            org: settings.destination_org.clone(),
            auth,
            installation_token: Mutex::new(None),
        })
    }

    /// Source-side client; the API base is derived per repository from its
    /// URL host.
    pub fn for_source(settings: &Settings) -> Result<Self, ForgeError> {
        let auth = match &settings.source_token {
            Some(token) => AuthMode::Token(token.clone()),
            None => AuthMode::Anonymous,
        };
        Ok(Self {
            http: Self::client()?,
            api_base: String::new(),
            org: String::new(),
            auth,
            installation_token: Mutex::new(None),
        })
    }

    fn source_api_base(host: &str) -> String {
        if host == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("https://{host}/api/v3")
        }
    }

    async fn auth_header(&self) -> Result<Option<String>, ForgeError> {
        match &self.auth {
            AuthMode::Anonymous => Ok(None),
            AuthMode::Token(token) => Ok(Some(format!("Bearer {token}"))),
            AuthMode::App {
                app_id,
                private_key,
                installation_id,
            } => {
                let token = self
                    .installation_token_for(app_id, private_key, installation_id)
                    .await?;
                Ok(Some(format!("Bearer {token}")))
            }
        }
    }

    async fn installation_token_for(
        &self,
        app_id: &str,
        private_key: &str,
        installation_id: &str,
    ) -> Result<String, ForgeError> {
        let mut cached = self.installation_token.lock().await;
        if let Some(existing) = cached.as_ref() {
            if existing.expires_at > Utc::now() + chrono::Duration::seconds(60) {
                return Ok(existing.token.clone());
            }
        }

        let jwt = mint_app_jwt(app_id, private_key)?;
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.api_base
        );
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {jwt}"))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(request_error)?;
        let response = check(response).await?;
        let body: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::permanent(format!("malformed token response: {e}")))?;
        let token = body.token.clone();
        *cached = Some(CachedToken {
            token: body.token,
            expires_at: body.expires_at,
        });
        debug!("Minted new GitHub App installation token");
        Ok(token)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, ForgeError> {
        let request = match self.auth_header().await? {
            Some(header) => request.header("Authorization", header),
            None => request,
        };
        let response = request
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(request_error)?;
        check(response).await
    }

    /// Whether a destination repository exists. 404 means free.
    async fn dest_repo(&self, name: &str) -> Result<Option<RepoResponse>, ForgeError> {
        let url = format!("{}/repos/{}/{name}", self.api_base, self.org);
        let request = match self.auth_header().await? {
            Some(header) => self.http.get(&url).header("Authorization", header),
            None => self.http.get(&url),
        };
        let response = request
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;
        let body: RepoResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::permanent(format!("malformed repo response: {e}")))?;
        Ok(Some(body))
    }

    async fn create_dest_repo(
        &self,
        name: &str,
        visibility: Visibility,
    ) -> Result<(), ForgeError> {
        let url = format!("{}/orgs/{}/repos", self.api_base, self.org);
        self.send(self.http.post(&url).json(&CreateRepoRequest {
            name: name.to_string(),
            visibility: visibility.to_string(),
        }))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SourceForge for GithubForge {
    async fn resolve_repo(&self, raw: &str) -> Result<ResolvedSource, ForgeError> {
        let parsed = parse_source_url(raw)?;
        if parsed.kind == SourceKind::AzureDevOps {
            return Err(ForgeError::permanent(
                "Azure DevOps URL routed to the GitHub adapter",
            ));
        }
        let api = Self::source_api_base(&parsed.host);
        let url = format!("{api}/repos/{}", parsed.canonical_id());
        let response = self.send(self.http.get(&url)).await?;
        let body: RepoResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::permanent(format!("malformed repo response: {e}")))?;
        let visibility = body
            .visibility
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Visibility::Private);
        Ok(ResolvedSource {
            canonical_id: parsed.canonical_id(),
            canonical_url: parsed.canonical_url(),
            visibility,
            size_bytes: body.size.unwrap_or(0) * 1024,
        })
    }

    async fn export_archive(&self, source: &ResolvedSource) -> Result<ArchiveHandle, ForgeError> {
        let parsed = parse_source_url(&source.canonical_url)?;
        let api = Self::source_api_base(&parsed.host);
        let owner = &parsed.segments[0];
        let repo = &parsed.segments[1];
        let url = format!("{api}/orgs/{owner}/migrations");
        let response = self
            .send(self.http.post(&url).json(&StartExportRequest {
                repositories: vec![repo.clone()],
                lock_repositories: false,
            }))
            .await?;
        let body: MigrationResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::permanent(format!("malformed export response: {e}")))?;
        Ok(ArchiveHandle {
            url: format!("{api}/orgs/{owner}/migrations/{}/archive", body.id),
        })
    }
}

#[async_trait]
impl DestForge for GithubForge {
    async fn ensure_repo(
        &self,
        name: &str,
        visibility: Visibility,
        on_collision: CollisionPolicy,
    ) -> Result<ResolvedTarget, ForgeError> {
        if self.dest_repo(name).await?.is_none() {
            self.create_dest_repo(name, visibility).await?;
            return Ok(ResolvedTarget {
                name: name.to_string(),
                renamed: false,
            });
        }

        match on_collision {
            CollisionPolicy::Skip => Ok(ResolvedTarget {
                name: name.to_string(),
                renamed: false,
            }),
            CollisionPolicy::Fail => Err(ForgeError::Conflict {
                name: name.to_string(),
            }),
            CollisionPolicy::Rename => {
                for candidate in rename_candidates(name).take(MAX_RENAME_CANDIDATES) {
                    if self.dest_repo(&candidate).await?.is_none() {
                        self.create_dest_repo(&candidate, visibility).await?;
                        return Ok(ResolvedTarget {
                            name: candidate,
                            renamed: true,
                        });
                    }
                }
                Err(ForgeError::permanent(format!(
                    "no free destination name for {name} after {MAX_RENAME_CANDIDATES} candidates"
                )))
            }
        }
    }

    async fn start_migration(
        &self,
        kind: MigrationKind,
        archive: &ArchiveHandle,
        target: &ResolvedTarget,
    ) -> Result<String, ForgeError> {
        let url = format!("{}/orgs/{}/migrations", self.api_base, self.org);
        let response = self
            .send(self.http.post(&url).json(&StartImportRequest {
                repository: target.name.clone(),
                archive_url: archive.url.clone(),
                dry_run: kind == MigrationKind::DryRun,
            }))
            .await?;
        let body: MigrationResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::permanent(format!("malformed migration response: {e}")))?;
        Ok(body.id.to_string())
    }

    async fn poll_migration(&self, external_id: &str) -> Result<MigrationPoll, ForgeError> {
        let url = format!("{}/orgs/{}/migrations/{external_id}", self.api_base, self.org);
        let response = self.send(self.http.get(&url)).await?;
        let body: MigrationStatusResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::permanent(format!("malformed status response: {e}")))?;
        match body.state.as_str() {
            "pending" | "exporting" | "preparing" => {
                Ok(MigrationPoll::running(MigrationPhase::PreparingArchive))
            }
            "queued" => Ok(MigrationPoll::running(MigrationPhase::Queued)),
            "importing" | "in_progress" => Ok(MigrationPoll::running(MigrationPhase::Migrating)),
            "exported" | "succeeded" | "complete" => Ok(MigrationPoll::succeeded()),
            "failed" => Ok(MigrationPoll::failed(
                body.failure_reason
                    .unwrap_or_else(|| "destination reported failure".to_string()),
            )),
            other => Err(ForgeError::permanent(format!(
                "unknown migration state {other}"
            ))),
        }
    }

    async fn cleanup(&self, external_id: &str) -> Result<(), ForgeError> {
        let url = format!(
            "{}/orgs/{}/migrations/{external_id}/archive",
            self.api_base, self.org
        );
        match self.send(self.http.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(ForgeError::Permanent { message }) if message.contains("404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_visibility(&self, name: &str, visibility: Visibility) -> Result<(), ForgeError> {
        let url = format!("{}/repos/{}/{name}", self.api_base, self.org);
        self.send(self.http.patch(&url).json(&UpdateRepoRequest {
            name: None,
            visibility: Some(visibility.to_string()),
        }))
        .await?;
        Ok(())
    }

    async fn rename_repo(&self, name: &str, new_name: &str) -> Result<(), ForgeError> {
        let url = format!("{}/repos/{}/{name}", self.api_base, self.org);
        let result = self
            .send(self.http.patch(&url).json(&UpdateRepoRequest {
                name: Some(new_name.to_string()),
                visibility: None,
            }))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ForgeError::Permanent { message }) if message.contains("422") => {
                Err(ForgeError::Conflict {
                    name: new_name.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn request_error(error: reqwest::Error) -> ForgeError {
    // Connection-level failures are always worth a retry.
    ForgeError::transient(format!("request failed: {error}"))
}

/// Map a non-success response to the error taxonomy, honoring Retry-After.
async fn check(response: Response) -> Result<Response, ForgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ForgeError::Transient {
            message: format!("rate limited: {excerpt}"),
            retry_after,
        });
    }
    if status == StatusCode::FORBIDDEN && body.contains("rate limit") {
        warn!("Secondary rate limit hit");
        return Err(ForgeError::Transient {
            message: format!("secondary rate limit: {excerpt}"),
            retry_after,
        });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ForgeError::AuthExpired);
    }
    if status.is_server_error() {
        return Err(ForgeError::Transient {
            message: format!("{status}: {excerpt}"),
            retry_after,
        });
    }
    Err(ForgeError::permanent(format!("{status}: {excerpt}")))
}

fn mint_app_jwt(app_id: &str, private_key: &str) -> Result<String, ForgeError> {
    let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
        .map_err(|_| ForgeError::AuthExpired)?;
    let now = Utc::now().timestamp();
    let claims = AppClaims {
        // Backdate to absorb clock skew; GitHub caps exp at 10 minutes.
        iat: now - 30,
        exp: now + 540,
        iss: app_id.to_string(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| ForgeError::permanent(format!("failed to sign App JWT: {e}")))
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RepoResponse {
    #[allow(dead_code)]
    full_name: Option<String>,
    visibility: Option<String>,
    /// Size in kilobytes, as the API reports it.
    size: Option<i64>,
}

#[derive(Serialize)]
struct CreateRepoRequest {
    name: String,
    visibility: String,
}

#[derive(Serialize)]
struct UpdateRepoRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    visibility: Option<String>,
}

#[derive(Serialize)]
struct StartExportRequest {
    repositories: Vec<String>,
    lock_repositories: bool,
}

#[derive(Serialize)]
struct StartImportRequest {
    repository: String,
    archive_url: String,
    dry_run: bool,
}

#[derive(Deserialize)]
struct MigrationResponse {
    id: i64,
}

#[derive(Deserialize)]
struct MigrationStatusResponse {
    state: String,
    failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_api_base() {
        assert_eq!(
            GithubForge::source_api_base("github.com"),
            "https://api.github.com"
        );
        assert_eq!(
            GithubForge::source_api_base("github.example.com"),
            "https://github.example.com/api/v3"
        );
    }

    #[test]
    fn test_app_jwt_rejects_bad_key() {
        assert!(matches!(
            mint_app_jwt("12345", "not a pem"),
            Err(ForgeError::AuthExpired)
        ));
    }
}
