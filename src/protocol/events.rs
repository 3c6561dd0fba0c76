use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::Role;
use crate::session::PendingToolCall;

/// One event on the client stream.
///
/// Every event carries a unique id and a timestamp that increases strictly within a
/// run, so clients can order and deduplicate after reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: OutputEventKind,
}

impl OutputEvent {
    pub fn event_name(&self) -> &'static str {
        self.kind.event_name()
    }
}

/// How a run ended when it did not error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The engine finished and the final state snapshot was emitted.
    Success,
    /// The run stopped for long-running tool calls; submit their results to resume.
    Interrupted { pending: Vec<PendingToolCall> },
}

impl RunOutcome {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputEventKind {
    RunStarted {
        #[serde(rename = "threadId")]
        thread_id: String,
        #[serde(rename = "runId")]
        run_id: String,
    },
    RunFinished {
        #[serde(rename = "threadId")]
        thread_id: String,
        #[serde(rename = "runId")]
        run_id: String,
        outcome: RunOutcome,
    },
    RunError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    TextMessageStart {
        #[serde(rename = "messageId")]
        message_id: String,
        role: Role,
    },
    TextMessageContent {
        #[serde(rename = "messageId")]
        message_id: String,
        delta: String,
    },
    TextMessageEnd {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        call_id: String,
        #[serde(rename = "toolCallName")]
        tool_name: String,
        arguments: Value,
        #[serde(rename = "longRunning", default)]
        long_running: bool,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        call_id: String,
        result: Value,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
    StateDelta {
        #[serde(rename = "delta")]
        patch_ops: Vec<Value>,
    },
    StateSnapshot {
        snapshot: Value,
    },
    Thinking {
        delta: String,
    },
    Custom {
        name: String,
        value: Value,
    },
}

impl OutputEventKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutputEventKind::RunStarted { .. } => "RUN_STARTED",
            OutputEventKind::RunFinished { .. } => "RUN_FINISHED",
            OutputEventKind::RunError { .. } => "RUN_ERROR",
            OutputEventKind::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            OutputEventKind::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            OutputEventKind::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            OutputEventKind::ToolCall { .. } => "TOOL_CALL",
            OutputEventKind::ToolResult { .. } => "TOOL_RESULT",
            OutputEventKind::StateDelta { .. } => "STATE_DELTA",
            OutputEventKind::StateSnapshot { .. } => "STATE_SNAPSHOT",
            OutputEventKind::Thinking { .. } => "THINKING",
            OutputEventKind::Custom { .. } => "CUSTOM",
        }
    }

    /// `RunFinished` or `RunError`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputEventKind::RunFinished { .. } | OutputEventKind::RunError { .. }
        )
    }

    pub fn run_started(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        OutputEventKind::RunStarted {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_finished(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        outcome: RunOutcome,
    ) -> Self {
        OutputEventKind::RunFinished {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            outcome,
        }
    }

    pub fn run_error(message: impl Into<String>, code: Option<&str>) -> Self {
        OutputEventKind::RunError {
            message: message.into(),
            code: code.map(str::to_string),
        }
    }

    pub fn text_message_start(message_id: impl Into<String>, role: Role) -> Self {
        OutputEventKind::TextMessageStart {
            message_id: message_id.into(),
            role,
        }
    }

    pub fn text_message_content(message_id: impl Into<String>, delta: impl Into<String>) -> Self {
        OutputEventKind::TextMessageContent {
            message_id: message_id.into(),
            delta: delta.into(),
        }
    }

    pub fn text_message_end(message_id: impl Into<String>) -> Self {
        OutputEventKind::TextMessageEnd {
            message_id: message_id.into(),
        }
    }

    pub fn custom(name: impl Into<String>, value: Value) -> Self {
        OutputEventKind::Custom {
            name: name.into(),
            value,
        }
    }
}

/// Stamps events with ids and strictly increasing millisecond timestamps.
#[derive(Debug, Default)]
pub struct EventClock {
    last: i64,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let ts = if now > self.last { now } else { self.last + 1 };
        self.last = ts;
        ts
    }

    pub fn stamp(&mut self, kind: OutputEventKind) -> OutputEvent {
        OutputEvent {
            id: Uuid::new_v4(),
            timestamp: self.next_timestamp(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag_and_envelope() {
        let mut clock = EventClock::new();
        let event = clock.stamp(OutputEventKind::text_message_content("m1", "Hi"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "TEXT_MESSAGE_CONTENT");
        assert_eq!(value["messageId"], "m1");
        assert_eq!(value["delta"], "Hi");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_i64());
        assert_eq!(event.event_name(), "TEXT_MESSAGE_CONTENT");
    }

    #[test]
    fn interrupted_outcome_lists_pending_calls() {
        let kind = OutputEventKind::run_finished(
            "t1",
            "r1",
            RunOutcome::Interrupted {
                pending: vec![PendingToolCall::new("call1", "search")],
            },
        );
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "RUN_FINISHED");
        assert_eq!(value["outcome"]["type"], "interrupted");
        assert_eq!(value["outcome"]["pending"][0]["callId"], "call1");
        assert!(kind.is_terminal());
    }

    #[test]
    fn event_round_trips_through_json() {
        let mut clock = EventClock::new();
        let event = clock.stamp(OutputEventKind::ToolCall {
            call_id: "c1".into(),
            tool_name: "search".into(),
            arguments: json!({"q": "x"}),
            long_running: true,
        });
        let text = serde_json::to_string(&event).unwrap();
        let parsed: OutputEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let mut clock = EventClock::new();
        let mut last = clock.next_timestamp();
        for _ in 0..1000 {
            let ts = clock.next_timestamp();
            assert!(ts > last);
            last = ts;
        }
    }
}
