use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Role attached to streamed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Assistant,
    User,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Assistant => "assistant",
            Role::User => "user",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// Engine-agnostic execution events, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InternalEvent {
    /// Incremental text for a message.
    TextDelta {
        #[serde(default)]
        role: Role,
        message_id: String,
        text: String,
    },
    /// The message is complete. Trailing text, if any, is streamed before the close.
    TextFinal {
        #[serde(default)]
        role: Role,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// The agent is invoking a tool.
    ToolCallRequested {
        call_id: String,
        tool_name: String,
        #[serde(default)]
        arguments: Value,
        /// Resolved outside this run (human approval, client-side tool).
        #[serde(default)]
        is_long_running: bool,
    },
    /// A tool invocation produced a result.
    ToolCallResult {
        call_id: String,
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// RFC 6902 operations against the conversation state.
    StateDelta { patch_ops: Vec<Value> },
    /// Agent reasoning.
    Thought { text: String },
    /// An event the engine emitted but could not classify.
    Unknown {
        kind: String,
        #[serde(default)]
        payload: Value,
    },
}

impl InternalEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            InternalEvent::TextDelta { .. } => "text_delta",
            InternalEvent::TextFinal { .. } => "text_final",
            InternalEvent::ToolCallRequested { .. } => "tool_call_requested",
            InternalEvent::ToolCallResult { .. } => "tool_call_result",
            InternalEvent::StateDelta { .. } => "state_delta",
            InternalEvent::Thought { .. } => "thought",
            InternalEvent::Unknown { .. } => "unknown",
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(
            self,
            InternalEvent::TextDelta { .. } | InternalEvent::TextFinal { .. }
        )
    }

    pub fn text_delta(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        InternalEvent::TextDelta {
            role: Role::Assistant,
            message_id: message_id.into(),
            text: text.into(),
        }
    }

    pub fn text_final(message_id: impl Into<String>) -> Self {
        InternalEvent::TextFinal {
            role: Role::Assistant,
            message_id: message_id.into(),
            text: None,
        }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        is_long_running: bool,
    ) -> Self {
        InternalEvent::ToolCallRequested {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            is_long_running,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, result: Value) -> Self {
        InternalEvent::ToolCallResult {
            call_id: call_id.into(),
            result,
            is_error: false,
        }
    }
}

/// The engine failed irrecoverably.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("engine failure: {message}")]
pub struct EngineFatalError {
    pub message: String,
    /// Set when the failure was raised by the event-wait timeout rather than the engine.
    pub timed_out: bool,
}

impl EngineFatalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
        }
    }
}

/// One item of an engine stream. `Err` is the engine's fatal-failure signal.
pub type EngineItem = Result<InternalEvent, EngineFatalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn internal_event_parses_from_tagged_json() {
        let ev: InternalEvent = serde_json::from_value(json!({
            "event": "tool_call_requested",
            "call_id": "call1",
            "tool_name": "search",
            "arguments": {"q": "rust"},
            "is_long_running": true
        }))
        .unwrap();
        assert_eq!(
            ev,
            InternalEvent::tool_call("call1", "search", json!({"q": "rust"}), true)
        );
    }

    #[test]
    fn text_delta_role_defaults_to_assistant() {
        let ev: InternalEvent = serde_json::from_value(json!({
            "event": "text_delta",
            "message_id": "m1",
            "text": "Hi"
        }))
        .unwrap();
        assert_eq!(ev, InternalEvent::text_delta("m1", "Hi"));
        assert!(ev.is_text());
    }

    #[test]
    fn unknown_event_keeps_its_own_kind() {
        let ev: InternalEvent = serde_json::from_value(json!({
            "event": "unknown",
            "kind": "citation",
            "payload": {"url": "https://example.com"}
        }))
        .unwrap();
        assert_eq!(
            ev,
            InternalEvent::Unknown {
                kind: "citation".into(),
                payload: json!({"url": "https://example.com"}),
            }
        );
        assert_eq!(serde_json::to_value(&ev).unwrap()["event"], "unknown");
    }
}
