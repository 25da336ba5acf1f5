use crate::tools::Tool;

/// Failures talking to the repository host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("GitHub API error: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error("{0} is not a file")]
    NotAFile(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidName { field: &'static str, reason: String },

    #[error("Unexpected response from GitHub: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{field} is required for {tool}")]
    MissingField { field: &'static str, tool: Tool },

    #[error("Invalid parameters for {tool}: {reason}")]
    InvalidParams { tool: Tool, reason: String },

    #[error("{0} is not a file")]
    NotAFile(String),

    #[error("{0}")]
    Host(String),

    #[error("Invalid request payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Could not determine tool_name. Received parameters: {}", .0.join(", "))]
    UndeterminableTool(Vec<String>),
}

impl ToolError {
    /// Routing failures are client errors at the transport level; everything
    /// else is folded into a `success: false` envelope.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            ToolError::UnknownTool(_) | ToolError::UndeterminableTool(_)
        )
    }
}

impl From<HostError> for ToolError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::NotAFile(path) => ToolError::NotAFile(path),
            other => ToolError::Host(other.to_string()),
        }
    }
}
