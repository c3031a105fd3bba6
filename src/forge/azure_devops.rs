//! Azure DevOps source adapter.
//!
//! Only source-side operations exist for ADO; the destination is always a
//! GitHub organization. Archive generation happens on the importer's side,
//! so the archive handle is the canonical source URL the destination pulls
//! from.

use super::url::{parse_source_url, SourceKind};
use super::{ArchiveHandle, ForgeError, ResolvedSource, SourceForge};
use crate::migration::models::{Settings, Visibility};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

pub struct AzureDevOpsForge {
    http: Client,
    pat: Option<String>,
}

impl AzureDevOpsForge {
    pub fn new(settings: &Settings) -> Result<Self, ForgeError> {
        let http = Client::builder()
            .user_agent("repo-migrator")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ForgeError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            pat: settings.source_token.clone(),
        })
    }

    fn auth_header(&self) -> Option<String> {
        self.pat
            .as_ref()
            .map(|pat| format!("Basic {}", BASE64_STANDARD.encode(format!(":{pat}"))))
    }
}

#[async_trait]
impl SourceForge for AzureDevOpsForge {
    async fn resolve_repo(&self, raw: &str) -> Result<ResolvedSource, ForgeError> {
        let parsed = parse_source_url(raw)?;
        if parsed.kind != SourceKind::AzureDevOps {
            return Err(ForgeError::permanent(
                "non-ADO URL routed to the Azure DevOps adapter",
            ));
        }
        let org = &parsed.segments[0];
        let project = &parsed.segments[1];
        let repo = &parsed.segments[2];
        let url = format!(
            "https://dev.azure.com/{org}/{project}/_apis/git/repositories/{repo}?api-version=7.1"
        );
        let mut request = self.http.get(&url);
        if let Some(header) = self.auth_header() {
            request = request.header("Authorization", header);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ForgeError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(200).collect();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ForgeError::AuthExpired,
                StatusCode::TOO_MANY_REQUESTS => {
                    ForgeError::transient(format!("rate limited: {excerpt}"))
                }
                s if s.is_server_error() => ForgeError::transient(format!("{s}: {excerpt}")),
                s => ForgeError::permanent(format!("{s}: {excerpt}")),
            });
        }

        let body: AdoRepoResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::permanent(format!("malformed repository response: {e}")))?;
        let visibility = match body
            .project
            .and_then(|p| p.visibility)
            .as_deref()
        {
            Some("public") => Visibility::Public,
            _ => Visibility::Private,
        };
        Ok(ResolvedSource {
            canonical_id: parsed.canonical_id(),
            canonical_url: parsed.canonical_url(),
            visibility,
            size_bytes: body.size.unwrap_or(0),
        })
    }

    async fn export_archive(&self, source: &ResolvedSource) -> Result<ArchiveHandle, ForgeError> {
        // The destination importer clones the source directly; the handle
        // carries the canonical URL it needs.
        Ok(ArchiveHandle {
            url: source.canonical_url.clone(),
        })
    }
}

#[derive(Deserialize)]
struct AdoRepoResponse {
    size: Option<i64>,
    project: Option<AdoProject>,
}

#[derive(Deserialize)]
struct AdoProject {
    visibility: Option<String>,
}
