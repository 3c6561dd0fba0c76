//! API request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EngineInfo;
use crate::session::RunInput;

/// Body of a run request (subset of the AG-UI `RunAgentInput`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAgentInput {
    pub thread_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<InputMessage>,
    #[serde(default)]
    pub state: Option<Value>,
}

impl RunAgentInput {
    /// Classify the request by its last message: a tool message resumes a paused
    /// call, a user message starts a new turn. Anything else carries no input.
    pub fn run_input(&self) -> Option<RunInput> {
        let last = self.messages.last()?;
        match last.role.as_str() {
            "tool" => {
                let call_id = last.tool_call_id.clone().filter(|id| !id.is_empty())?;
                let is_error = last.error.is_some();
                let result = match (&last.content, &last.error) {
                    (Some(content), _) => tool_content(content),
                    (None, Some(error)) => Value::String(error.clone()),
                    (None, None) => Value::Null,
                };
                Some(RunInput::ToolResult {
                    call_id,
                    result,
                    is_error,
                })
            }
            "user" => {
                let content = last.content.as_ref().map(text_content)?;
                Some(RunInput::UserMessage { content })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// Set on tool messages whose tool failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// Tool results usually arrive JSON-encoded in a string.
fn tool_content(content: &Value) -> Value {
    match content {
        Value::String(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        other => other.clone(),
    }
}

/// Plain string, or the text parts of a multi-part message.
fn text_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Conversation store backend in use
    pub store: String,

    /// Whether conversations survive a restart
    pub persistent: bool,

    /// Runs currently holding a session
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct AppsResponse {
    pub default_app: String,
    pub apps: Vec<EngineInfo>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}
