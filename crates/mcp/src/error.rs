//! Errors returned by the query tools.

use thiserror::Error;

use pipeline::RelayError;

/// A tool call that could not be answered.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error(transparent)]
    Store(#[from] RelayError),
}

impl ToolError {
    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool { .. } => "unknown_tool",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::NotFound { .. } => "not_found",
            ToolError::Store(_) => "store",
        }
    }

    pub(crate) fn invalid(tool: &str, reason: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}
