//! Tool execution. Each handler reports progress through the broadcaster and
//! returns a `Result`; flattening into the response envelope happens in the
//! HTTP layer.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::ToolError;
use crate::events::{now_iso, Broadcaster, EventType, StatusEvent};
use crate::host::{EntryKind, NewIssue, RepositoryHost, TreeEntry};
use crate::tools::{LineRange, Tool, ToolRequest};

/// Path prefixes never shown to the agent.
pub const EXCLUDED_PREFIXES: [&str; 7] = [
    ".git/",
    "node_modules/",
    ".next/",
    "dist/",
    "build/",
    ".vercel/",
    "coverage/",
];

pub const DEFAULT_REPORTER: &str = "Voice Bug Agent";

#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn RepositoryHost>,
    events: Arc<Broadcaster>,
    reporter: String,
}

impl Dispatcher {
    pub fn new(host: Arc<dyn RepositoryHost>, events: Arc<Broadcaster>, reporter: String) -> Self {
        Self {
            host,
            events,
            reporter,
        }
    }

    pub fn events(&self) -> &Arc<Broadcaster> {
        &self.events
    }

    /// Validate and run `tool`. Failures are logged and broadcast as an
    /// `error` event with the tool's own status line before being returned.
    pub async fn invoke(&self, tool: Tool, params: Value) -> Result<Value, ToolError> {
        let result = self.run(tool, params).await;
        if let Err(e) = &result {
            self.report_failure(tool.failure_status(), e);
        }
        result
    }

    /// Validate and run `tool` without reporting failures.
    pub async fn run(&self, tool: Tool, params: Value) -> Result<Value, ToolError> {
        tracing::info!(tool = %tool, "Executing tool");
        let request = ToolRequest::parse(tool, params)?;
        let data = self.execute(request).await?;
        tracing::info!(tool = %tool, "Tool completed");
        Ok(data)
    }

    /// Log and broadcast a failure that happened outside a handler.
    pub fn report_failure(&self, status: &str, error: &ToolError) {
        tracing::error!(error = %error, "{}", status);
        self.events.broadcast(
            StatusEvent::new(status, EventType::Error).with_meta("error", error.to_string()),
        );
    }

    pub async fn execute(&self, request: ToolRequest) -> Result<Value, ToolError> {
        match request {
            ToolRequest::LogConversation {
                status,
                kind,
                metadata,
            } => Ok(self.log_conversation(status, kind, metadata)),
            ToolRequest::GetRepoTree { path } => self.get_repo_tree(path).await,
            ToolRequest::ReadFileContent { file_path, range } => {
                self.read_file_content(file_path, range).await
            }
            ToolRequest::CreateGithubIssue {
                title,
                body,
                labels,
                priority,
                code_snippet,
                file_path,
                line_number,
            } => {
                let body = with_location(
                    body,
                    file_path.as_deref(),
                    line_number,
                    code_snippet.as_deref(),
                );
                self.create_github_issue(title, body, labels, priority).await
            }
        }
    }

    fn log_conversation(
        &self,
        status: String,
        kind: EventType,
        metadata: Map<String, Value>,
    ) -> Value {
        let mut event = StatusEvent::new(status.clone(), kind.clone());
        event.metadata = metadata;
        self.events.broadcast(event);
        json!({ "status": status, "type": kind })
    }

    async fn get_repo_tree(&self, path: Option<String>) -> Result<Value, ToolError> {
        tracing::debug!(hint = path.as_deref().unwrap_or(""), "Fetching full repository structure");
        self.events.broadcast(
            StatusEvent::new("Loading repository structure...", EventType::Investigating)
                .with_meta("tool", Tool::GetRepoTree.name()),
        );

        let tree = filter_tree(self.host.full_tree().await?);
        let total_files = tree.iter().filter(|e| e.kind == EntryKind::File).count();
        let total_dirs = tree.iter().filter(|e| e.kind == EntryKind::Dir).count();

        Ok(json!({
            "tree": tree,
            "total_files": total_files,
            "total_dirs": total_dirs,
            "message": "Full repository structure retrieved. Analyze this to find relevant files for the user's issue.",
        }))
    }

    async fn read_file_content(
        &self,
        file_path: String,
        range: Option<LineRange>,
    ) -> Result<Value, ToolError> {
        let name = file_path.rsplit('/').next().unwrap_or(&file_path);
        self.events.broadcast(
            StatusEvent::new(format!("Reading {}...", name), EventType::Investigating)
                .with_meta("tool", Tool::ReadFileContent.name())
                .with_meta("file_path", file_path.as_str()),
        );

        let blob = self.host.read_file(&file_path).await?;
        let content = match range {
            Some(r) => slice_lines(&blob.content, r),
            None => blob.content,
        };

        Ok(json!({
            "path": blob.path,
            "content": content,
            "size": blob.size,
            "lineRange": range,
        }))
    }

    async fn create_github_issue(
        &self,
        title: String,
        body: String,
        labels: Vec<String>,
        priority: String,
    ) -> Result<Value, ToolError> {
        self.events.broadcast(
            StatusEvent::new("Creating bug report...", EventType::Resolving)
                .with_meta("tool", Tool::CreateGithubIssue.name())
                .with_meta("title", title.as_str()),
        );

        let labels = merge_labels(labels, &priority);
        let body = format!(
            "{}\n\n---\n**Reported by**: {}\n**Timestamp**: {}",
            body,
            self.reporter,
            now_iso()
        );
        let issue = self
            .host
            .create_issue(NewIssue {
                title,
                body,
                labels: labels.clone(),
            })
            .await?;

        self.events.broadcast(
            StatusEvent::new("Bug report created successfully", EventType::Resolved)
                .with_meta("tool", Tool::CreateGithubIssue.name())
                .with_meta("issue_number", issue.number)
                .with_meta("issue_url", issue.url.as_str()),
        );

        Ok(json!({
            "issue_number": issue.number,
            "issue_url": issue.url,
            "labels": labels,
            "message": "Issue created successfully",
        }))
    }
}

/// Drop build output and dependency directories.
pub fn filter_tree(tree: Vec<TreeEntry>) -> Vec<TreeEntry> {
    tree.into_iter()
        .filter(|e| !EXCLUDED_PREFIXES.iter().any(|p| e.path.starts_with(p)))
        .collect()
}

/// Lines `start..=end` (1-indexed) joined by `\n`. Out-of-range bounds clamp.
pub fn slice_lines(content: &str, range: LineRange) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let start = (range.start.saturating_sub(1) as usize).min(lines.len());
    let end = (range.end as usize).min(lines.len()).max(start);
    lines[start..end].join("\n")
}

/// Caller labels followed by the priority and origin labels, without duplicates.
pub fn merge_labels(labels: Vec<String>, priority: &str) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(labels.len() + 2);
    let extra = [format!("priority: {}", priority), "customer-reported".to_string()];
    for label in labels.into_iter().chain(extra) {
        if !merged.contains(&label) {
            merged.push(label);
        }
    }
    merged
}

/// Append a location section when any code context was supplied.
pub fn with_location(
    mut body: String,
    file_path: Option<&str>,
    line_number: Option<u64>,
    code_snippet: Option<&str>,
) -> String {
    if file_path.is_none() && line_number.is_none() && code_snippet.is_none() {
        return body;
    }

    body.push_str("\n\n---\n\n### 📍 Location\n\n");
    if let Some(path) = file_path {
        body.push_str(&format!("**File:** `{}`\n", path));
    }
    if let Some(line) = line_number {
        body.push_str(&format!("**Line:** {}\n", line));
    }
    if let Some(code) = code_snippet {
        let lang = file_path.map(fence_language).unwrap_or("");
        body.push_str(&format!("\n**Code:**\n```{}\n{}\n```\n", lang, code));
    }
    body
}

fn fence_language(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext {
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "rs" => "rust",
        "py" => "python",
        "go" => "go",
        "rb" => "ruby",
        "java" => "java",
        "css" => "css",
        "html" => "html",
        "json" => "json",
        "sh" => "bash",
        _ => "",
    }
}
