use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A discrete event produced by an agent run.
///
/// This is the shape agent processes print, one JSON object per line, and
/// the shape re-emitted to HTTP clients inside `event` stream records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Reasoning output.
    Thinking { content: String },
    /// Incremental assistant text.
    TextDelta { content: String },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        id: String,
        name: String,
        #[serde(default)]
        result: Value,
    },
    /// A complete assistant message.
    Message { content: String },
    /// The run failed. Always the last event of a run.
    Error { message: String },
    MessageComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            _ => None,
        }
    }
}
