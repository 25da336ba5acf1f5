//! The repository host: tree listing, file contents and issue creation.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;

use crate::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileBlob {
    pub path: String,
    /// Decoded text content.
    pub content: String,
    pub size: u64,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedIssue {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub state: String,
}

/// Source-control capabilities the tools rely on.
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// Every entry of the default branch, recursively.
    async fn full_tree(&self) -> Result<Vec<TreeEntry>, HostError>;

    async fn read_file(&self, path: &str) -> Result<FileBlob, HostError>;

    async fn create_issue(&self, issue: NewIssue) -> Result<CreatedIssue, HostError>;
}

/// `RepositoryHost` backed by the GitHub REST API.
#[derive(Clone)]
pub struct GithubHost {
    github: Arc<octocrab::Octocrab>,
    owner: String,
    repo: String,
}

impl GithubHost {
    pub fn new(github: octocrab::Octocrab, owner: String, repo: String) -> Result<Self, HostError> {
        sanitize_github_name(&owner, "owner")?;
        sanitize_github_name(&repo, "repo")?;
        Ok(Self {
            github: Arc::new(github),
            owner,
            repo,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

#[async_trait]
impl RepositoryHost for GithubHost {
    async fn full_tree(&self) -> Result<Vec<TreeEntry>, HostError> {
        tracing::info!(repo = %self.full_name(), "Fetching full repository tree");

        let route = format!(
            "/repos/{}/{}/git/trees/HEAD?recursive=1",
            self.owner, self.repo
        );
        let response: serde_json::Value = self.github.get(&route, None::<&()>).await?;
        let tree = parse_tree(&response)?;

        tracing::info!(entries = tree.len(), "Retrieved repository tree");
        Ok(tree)
    }

    async fn read_file(&self, path: &str) -> Result<FileBlob, HostError> {
        let encoded = encode_repo_path(path, "file_path")?;
        tracing::info!(repo = %self.full_name(), path, "Reading file");

        let route = format!("/repos/{}/{}/contents/{}", self.owner, self.repo, encoded);
        let response: serde_json::Value = self.github.get(&route, None::<&()>).await?;
        parse_file(path, &response)
    }

    async fn create_issue(&self, issue: NewIssue) -> Result<CreatedIssue, HostError> {
        let NewIssue {
            title,
            body,
            labels,
        } = issue;
        tracing::info!(repo = %self.full_name(), title = %title, "Creating issue");

        let created = self
            .github
            .issues(&self.owner, &self.repo)
            .create(title)
            .body(body)
            .labels(labels)
            .send()
            .await?;

        tracing::info!(number = created.number, "Issue created");
        Ok(CreatedIssue {
            number: created.number,
            url: created.html_url.to_string(),
            title: created.title,
            state: format_state(&created.state).to_string(),
        })
    }
}

fn format_state(state: &octocrab::models::IssueState) -> &'static str {
    match state {
        octocrab::models::IssueState::Open => "open",
        octocrab::models::IssueState::Closed => "closed",
        _ => "unknown",
    }
}

/// Map a git-trees API response into entries. Blobs become files, everything
/// else (trees, submodule commits) becomes a directory.
fn parse_tree(response: &serde_json::Value) -> Result<Vec<TreeEntry>, HostError> {
    let items = response
        .get("tree")
        .and_then(|t| t.as_array())
        .ok_or_else(|| HostError::Malformed("missing `tree` array".to_string()))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let path = item.get("path")?.as_str()?.to_string();
            let kind = match item.get("type").and_then(|t| t.as_str()) {
                Some("blob") => EntryKind::File,
                _ => EntryKind::Dir,
            };
            Some(TreeEntry {
                path,
                kind,
                size: item.get("size").and_then(|s| s.as_u64()),
                sha: item
                    .get("sha")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect())
}

/// Decode a contents API response for a single file.
fn parse_file(path: &str, response: &serde_json::Value) -> Result<FileBlob, HostError> {
    // Directories come back as an array of entries.
    if response.is_array() || response.get("type").and_then(|t| t.as_str()) != Some("file") {
        return Err(HostError::NotAFile(path.to_string()));
    }

    // GitHub returns base64 with embedded newlines
    let encoded: String = response
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&encoded)
        .map_err(|e| HostError::Malformed(format!("invalid base64 content: {}", e)))?;

    Ok(FileBlob {
        path: response
            .get("path")
            .and_then(|p| p.as_str())
            .unwrap_or(path)
            .to_string(),
        size: response
            .get("size")
            .and_then(|s| s.as_u64())
            .unwrap_or(bytes.len() as u64),
        sha: response
            .get("sha")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        content: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Validate that a GitHub owner/repo name doesn't contain characters that
/// could be used for URL injection in raw API routes.
fn sanitize_github_name(name: &str, field: &'static str) -> Result<(), HostError> {
    if name.is_empty() {
        return Err(HostError::InvalidName {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    for ch in ['/', '?', '#', '%', '\0', ' ', '\n', '\t'] {
        if name.contains(ch) {
            return Err(HostError::InvalidName {
                field,
                reason: format!("contains invalid character {:?}", ch),
            });
        }
    }
    Ok(())
}

/// Characters left as-is in a path segment: RFC 3986 unreserved.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Validate a repository-relative file path. Slashes separate segments;
/// `.`/`..` and empty segments would escape or alias the contents route.
fn sanitize_url_value(value: &str, field: &'static str) -> Result<(), HostError> {
    if value.is_empty() {
        return Err(HostError::InvalidName {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    for ch in ['\0', '\n', '\r', '\t'] {
        if value.contains(ch) {
            return Err(HostError::InvalidName {
                field,
                reason: format!("contains invalid character {:?}", ch),
            });
        }
    }
    if let Some(seg) = value
        .split('/')
        .find(|seg| seg.is_empty() || *seg == "." || *seg == "..")
    {
        return Err(HostError::InvalidName {
            field,
            reason: format!("contains invalid path segment {:?}", seg),
        });
    }
    Ok(())
}

/// Validate `path` and percent-encode each segment for use in a route.
fn encode_repo_path(path: &str, field: &'static str) -> Result<String, HostError> {
    let path = path.trim_start_matches('/');
    sanitize_url_value(path, field)?;
    Ok(path
        .split('/')
        .map(|seg| utf8_percent_encode(seg, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/"))
}
