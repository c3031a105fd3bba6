//! Source URL parsing.
//!
//! Accepted shapes:
//!   - GitHub: `https://{host}/{owner}/{repo}[.git]`
//!   - Azure DevOps modern: `https://[user@]dev.azure.com/{org}/{project}/_git/{repo}[.git]`
//!   - Azure DevOps SSH: `git@ssh.dev.azure.com:v3/{org}/{project}/{repo}[.git]`
//!   - Azure DevOps legacy: `https://{org}.visualstudio.com/{project}/_git/{repo}[.git]`
//!
//! A trailing `.git` is stripped everywhere. The canonical identifier is
//! `{owner}/{repo}` for GitHub and `{org}/{project}/{repo}` for Azure DevOps.

use super::ForgeError;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    GithubCloud,
    GithubEnterprise,
    AzureDevOps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSourceUrl {
    pub kind: SourceKind,
    /// Host of the source forge, e.g. `github.example.com` or `dev.azure.com`.
    pub host: String,
    /// Path segments: `[owner, repo]` or `[org, project, repo]`.
    pub segments: Vec<String>,
}

impl ParsedSourceUrl {
    pub fn canonical_id(&self) -> String {
        self.segments.join("/")
    }

    pub fn canonical_url(&self) -> String {
        match self.kind {
            SourceKind::AzureDevOps => format!(
                "https://dev.azure.com/{}/{}/_git/{}",
                self.segments[0], self.segments[1], self.segments[2]
            ),
            _ => format!("https://{}/{}", self.host, self.segments.join("/")),
        }
    }

    /// Default destination repository name: the repo segment for GitHub,
    /// `{org}-{project}-{repo}` for Azure DevOps, lowercased.
    pub fn default_destination_name(&self) -> String {
        match self.kind {
            SourceKind::AzureDevOps => self.segments.join("-").to_lowercase(),
            _ => self.segments[self.segments.len() - 1].to_lowercase(),
        }
    }
}

fn invalid(url: &str, message: impl Into<String>) -> ForgeError {
    ForgeError::InvalidUrl {
        url: url.to_string(),
        message: message.into(),
    }
}

fn strip_git_suffix(segment: &str) -> &str {
    segment.strip_suffix(".git").unwrap_or(segment)
}

pub fn parse_source_url(raw: &str) -> Result<ParsedSourceUrl, ForgeError> {
    let raw = raw.trim();

    // SCP-style Azure DevOps SSH remotes are not RFC URLs; handle them first.
    if let Some(rest) = raw.strip_prefix("git@ssh.dev.azure.com:v3/") {
        let segments: Vec<String> = rest
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| strip_git_suffix(s).to_string())
            .collect();
        if segments.len() != 3 {
            return Err(invalid(raw, "expected v3/{org}/{project}/{repo}"));
        }
        return Ok(ParsedSourceUrl {
            kind: SourceKind::AzureDevOps,
            host: "dev.azure.com".to_string(),
            segments,
        });
    }

    let parsed = Url::parse(raw).map_err(|e| invalid(raw, e.to_string()))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(invalid(raw, format!("unsupported scheme {}", parsed.scheme())));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid(raw, "missing host"))?
        .to_lowercase();
    let segments: Vec<String> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();

    if host == "dev.azure.com" {
        // /{org}/{project}/_git/{repo}
        if segments.len() != 4 || segments[2] != "_git" {
            return Err(invalid(raw, "expected /{org}/{project}/_git/{repo}"));
        }
        return Ok(ParsedSourceUrl {
            kind: SourceKind::AzureDevOps,
            host,
            segments: vec![
                segments[0].clone(),
                segments[1].clone(),
                strip_git_suffix(&segments[3]).to_string(),
            ],
        });
    }

    if let Some(org) = host.strip_suffix(".visualstudio.com") {
        // /{project}/_git/{repo}
        if segments.len() != 3 || segments[1] != "_git" {
            return Err(invalid(raw, "expected /{project}/_git/{repo}"));
        }
        return Ok(ParsedSourceUrl {
            kind: SourceKind::AzureDevOps,
            host: "dev.azure.com".to_string(),
            segments: vec![
                org.to_string(),
                segments[0].clone(),
                strip_git_suffix(&segments[2]).to_string(),
            ],
        });
    }

    // Everything else is a GitHub shape: /{owner}/{repo}
    if segments.len() != 2 {
        return Err(invalid(raw, "expected /{owner}/{repo}"));
    }
    let kind = if host == "github.com" {
        SourceKind::GithubCloud
    } else {
        SourceKind::GithubEnterprise
    };
    Ok(ParsedSourceUrl {
        kind,
        host,
        segments: vec![
            segments[0].clone(),
            strip_git_suffix(&segments[1]).to_string(),
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_cloud() {
        let parsed = parse_source_url("https://github.com/acme/web").unwrap();
        assert_eq!(parsed.kind, SourceKind::GithubCloud);
        assert_eq!(parsed.canonical_id(), "acme/web");
        assert_eq!(parsed.default_destination_name(), "web");
    }

    #[test]
    fn test_github_enterprise_with_git_suffix() {
        let parsed = parse_source_url("https://github.example.com/acme/web.git").unwrap();
        assert_eq!(parsed.kind, SourceKind::GithubEnterprise);
        assert_eq!(parsed.canonical_id(), "acme/web");
        assert_eq!(parsed.canonical_url(), "https://github.example.com/acme/web");
    }

    #[test]
    fn test_ado_modern_https() {
        let parsed =
            parse_source_url("https://dev.azure.com/contoso/MyProject/_git/MyRepo").unwrap();
        assert_eq!(parsed.kind, SourceKind::AzureDevOps);
        assert_eq!(parsed.canonical_id(), "contoso/MyProject/MyRepo");
    }

    #[test]
    fn test_ado_modern_https_with_user() {
        let parsed =
            parse_source_url("https://alice@dev.azure.com/contoso/MyProject/_git/MyRepo.git")
                .unwrap();
        assert_eq!(parsed.canonical_id(), "contoso/MyProject/MyRepo");
    }

    #[test]
    fn test_ado_ssh() {
        let parsed =
            parse_source_url("git@ssh.dev.azure.com:v3/contoso/MyProject/MyRepo.git").unwrap();
        assert_eq!(parsed.kind, SourceKind::AzureDevOps);
        assert_eq!(parsed.canonical_id(), "contoso/MyProject/MyRepo");
        assert_eq!(
            parsed.canonical_url(),
            "https://dev.azure.com/contoso/MyProject/_git/MyRepo"
        );
        assert_eq!(
            parsed.default_destination_name(),
            "contoso-myproject-myrepo"
        );
    }

    #[test]
    fn test_ado_legacy() {
        let parsed =
            parse_source_url("https://contoso.visualstudio.com/MyProject/_git/MyRepo").unwrap();
        assert_eq!(parsed.kind, SourceKind::AzureDevOps);
        assert_eq!(parsed.canonical_id(), "contoso/MyProject/MyRepo");
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        assert!(parse_source_url("ftp://github.com/acme/web").is_err());
        assert!(parse_source_url("https://github.com/acme").is_err());
        assert!(parse_source_url("https://dev.azure.com/contoso/MyProject/MyRepo").is_err());
        assert!(parse_source_url("git@ssh.dev.azure.com:v3/contoso/MyRepo").is_err());
    }
}
