//! Tool catalogue: names, parameter schemas, validation and routing.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::events::EventType;

/// The fixed set of callable tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    LogConversation,
    GetRepoTree,
    ReadFileContent,
    CreateGithubIssue,
}

impl Tool {
    pub const ALL: [Tool; 4] = [
        Tool::LogConversation,
        Tool::GetRepoTree,
        Tool::ReadFileContent,
        Tool::CreateGithubIssue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tool::LogConversation => "log_conversation",
            Tool::GetRepoTree => "get_repo_tree",
            Tool::ReadFileContent => "read_file_content",
            Tool::CreateGithubIssue => "create_github_issue",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Tool::ALL.iter().map(|t| t.name()).collect()
    }

    pub fn description(self) -> &'static str {
        match self {
            Tool::LogConversation => "Broadcast a status update to the live UI",
            Tool::GetRepoTree => "List every file and directory in the repository",
            Tool::ReadFileContent => "Read a file, optionally limited to a line range",
            Tool::CreateGithubIssue => "File a bug report as a GitHub issue",
        }
    }

    /// JSON Schema of the tool's parameters.
    pub fn input_schema(self) -> schemars::Schema {
        match self {
            Tool::LogConversation => schemars::schema_for!(LogConversationParams),
            Tool::GetRepoTree => schemars::schema_for!(RepoTreeParams),
            Tool::ReadFileContent => schemars::schema_for!(ReadFileParams),
            Tool::CreateGithubIssue => schemars::schema_for!(CreateIssueParams),
        }
    }

    /// Status line broadcast when this tool fails.
    pub fn failure_status(self) -> &'static str {
        match self {
            Tool::LogConversation => "Error logging status",
            Tool::GetRepoTree => "Error loading repository structure",
            Tool::ReadFileContent => "Error reading file",
            Tool::CreateGithubIssue => "Error creating bug report",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tool {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tool::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| ToolError::UnknownTool(s.to_string()))
    }
}

// -- Tool parameter types --

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct LogConversationParams {
    #[schemars(description = "Status message to display")]
    #[serde(default)]
    pub status: Option<String>,

    #[schemars(
        description = "Event type: info, investigating, resolving, resolved or error (default: info)"
    )]
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    #[schemars(description = "Additional context shown alongside the status")]
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RepoTreeParams {
    #[schemars(description = "Directory hint; the full tree is always returned")]
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ReadFileParams {
    #[schemars(description = "File path within the repository")]
    #[serde(default)]
    pub file_path: Option<String>,

    #[schemars(description = "First line to return (1-indexed, inclusive)")]
    #[serde(default)]
    pub start_line: Option<u64>,

    #[schemars(description = "Last line to return (1-indexed, inclusive)")]
    #[serde(default)]
    pub end_line: Option<u64>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CreateIssueParams {
    #[schemars(description = "Issue title")]
    #[serde(default)]
    pub title: Option<String>,

    #[schemars(description = "Issue description (Markdown)")]
    #[serde(default)]
    pub body: Option<String>,

    #[schemars(description = "Label names (default: [\"bug\"])")]
    #[serde(default)]
    pub labels: Option<Vec<String>>,

    #[schemars(description = "Priority: low, medium, high or critical (default: medium)")]
    #[serde(default)]
    pub priority: Option<String>,

    #[schemars(description = "Relevant code excerpt")]
    #[serde(default)]
    pub code_snippet: Option<String>,

    #[schemars(description = "File the bug is located in")]
    #[serde(default)]
    pub file_path: Option<String>,

    #[schemars(description = "Line the bug is located at")]
    #[serde(default)]
    pub line_number: Option<u64>,
}

// -- Validated requests --

/// Inclusive, 1-indexed line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    LogConversation {
        status: String,
        kind: EventType,
        metadata: Map<String, Value>,
    },
    GetRepoTree {
        path: Option<String>,
    },
    ReadFileContent {
        file_path: String,
        /// Only set when both bounds were supplied.
        range: Option<LineRange>,
    },
    CreateGithubIssue {
        title: String,
        body: String,
        labels: Vec<String>,
        priority: String,
        code_snippet: Option<String>,
        file_path: Option<String>,
        line_number: Option<u64>,
    },
}

impl ToolRequest {
    pub fn tool(&self) -> Tool {
        match self {
            ToolRequest::LogConversation { .. } => Tool::LogConversation,
            ToolRequest::GetRepoTree { .. } => Tool::GetRepoTree,
            ToolRequest::ReadFileContent { .. } => Tool::ReadFileContent,
            ToolRequest::CreateGithubIssue { .. } => Tool::CreateGithubIssue,
        }
    }

    /// Validate raw parameters for `tool`.
    pub fn parse(tool: Tool, params: Value) -> Result<Self, ToolError> {
        match tool {
            Tool::LogConversation => {
                let p: LogConversationParams = decode(tool, params)?;
                Ok(ToolRequest::LogConversation {
                    status: required(tool, "status", p.status)?,
                    kind: p
                        .kind
                        .filter(|k| !k.is_empty())
                        .map(EventType::from)
                        .unwrap_or(EventType::Info),
                    metadata: p.metadata.unwrap_or_default(),
                })
            }
            Tool::GetRepoTree => {
                let p: RepoTreeParams = decode(tool, params)?;
                Ok(ToolRequest::GetRepoTree { path: p.path })
            }
            Tool::ReadFileContent => {
                let p: ReadFileParams = decode(tool, params)?;
                let file_path = required(tool, "file_path", p.file_path)?;
                let range = match (p.start_line, p.end_line) {
                    (Some(start), Some(end)) => {
                        if start == 0 || end < start {
                            return Err(ToolError::InvalidParams {
                                tool,
                                reason: format!(
                                    "line range {}-{} must satisfy 1 <= start_line <= end_line",
                                    start, end
                                ),
                            });
                        }
                        Some(LineRange { start, end })
                    }
                    // A single bound is not enough to define a slice.
                    _ => None,
                };
                Ok(ToolRequest::ReadFileContent { file_path, range })
            }
            Tool::CreateGithubIssue => {
                let p: CreateIssueParams = decode(tool, params)?;
                Ok(ToolRequest::CreateGithubIssue {
                    title: required(tool, "title", p.title)?,
                    body: required(tool, "body", p.body)?,
                    labels: p.labels.unwrap_or_else(|| vec!["bug".to_string()]),
                    priority: p
                        .priority
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "medium".to_string()),
                    code_snippet: p.code_snippet.filter(|s| !s.is_empty()),
                    file_path: p.file_path.filter(|s| !s.is_empty()),
                    line_number: p.line_number.filter(|n| *n > 0),
                })
            }
        }
    }
}

fn decode<T: DeserializeOwned>(tool: Tool, params: Value) -> Result<T, ToolError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| ToolError::InvalidParams {
        tool,
        reason: e.to_string(),
    })
}

fn required(tool: Tool, field: &'static str, value: Option<String>) -> Result<String, ToolError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ToolError::MissingField { field, tool })
}

// -- Routing --

/// Resolve a webhook payload into a tool and its parameters.
///
/// The payload is either `{tool_name, parameters}` or bare parameters, in
/// which case the tool is inferred from the keys present.
pub fn resolve(payload: Value) -> Result<(Tool, Value), ToolError> {
    let mut payload = match payload {
        Value::Object(map) => map,
        other => {
            return Err(ToolError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let tool_name = match payload.remove("tool_name") {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    };
    let params = match payload.remove("parameters") {
        Some(Value::Object(p)) => p,
        _ => payload,
    };

    let tool = match tool_name {
        Some(name) => name.parse::<Tool>()?,
        None => detect(&params)
            .ok_or_else(|| ToolError::UndeterminableTool(params.keys().cloned().collect()))?,
    };
    Ok((tool, Value::Object(params)))
}

/// Infer the tool from which parameters are present.
pub fn detect(params: &Map<String, Value>) -> Option<Tool> {
    let has = |key: &str| params.get(key).is_some_and(is_truthy);

    if has("status") && has("type") {
        Some(Tool::LogConversation)
    } else if params.contains_key("path") && !has("file_path") {
        Some(Tool::GetRepoTree)
    } else if has("file_path") && !has("title") {
        Some(Tool::ReadFileContent)
    } else if has("title") && has("body") {
        Some(Tool::CreateGithubIssue)
    } else {
        None
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
