//! Demo engine: echoes user input word by word.
//!
//! Input starting with `/approve ` asks for human approval through a long-running
//! `request_approval` tool call, which pauses the run until the client submits a result.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    EngineFatalError, EngineInput, EngineItem, EngineRequest, EngineRun, ExecutionEngine,
    InternalEvent,
};

const APPROVAL_PREFIX: &str = "/approve ";
const APPROVAL_TOOL: &str = "request_approval";

pub struct EchoEngine {
    id: String,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self {
            id: "echo".to_string(),
        }
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionEngine for EchoEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Echo"
    }

    async fn start(&self, request: EngineRequest) -> Result<EngineRun, EngineFatalError> {
        let events = plan_events(&request);
        let (tx, rx) = mpsc::channel::<EngineItem>(64);
        let run_id = request.run_id;
        let handle = tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    debug!(run_id = %run_id, "echo engine receiver dropped");
                    break;
                }
            }
        });
        Ok(EngineRun::new(rx, handle))
    }
}

fn plan_events(request: &EngineRequest) -> Vec<InternalEvent> {
    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let turns = request
        .state
        .get("turns")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        + 1;
    let mut events = Vec::new();

    match &request.input {
        EngineInput::UserMessage { content } => {
            if let Some(action) = content.strip_prefix(APPROVAL_PREFIX) {
                events.push(InternalEvent::text_delta(
                    &message_id,
                    format!("Waiting for approval: {}", action.trim()),
                ));
                events.push(InternalEvent::tool_call(
                    format!("call_{}", Uuid::new_v4().simple()),
                    APPROVAL_TOOL,
                    json!({ "action": action.trim() }),
                    true,
                ));
            } else {
                events.extend(chunk_words(content).into_iter().map(|chunk| {
                    InternalEvent::text_delta(&message_id, chunk)
                }));
                events.push(InternalEvent::text_final(&message_id));
            }
        }
        EngineInput::ToolResult {
            tool_name, result, ..
        } => {
            events.push(InternalEvent::text_delta(
                &message_id,
                format!("{} returned {}", tool_name, result),
            ));
            events.push(InternalEvent::text_final(&message_id));
            events.push(InternalEvent::StateDelta {
                patch_ops: vec![json!({
                    "op": "add",
                    "path": "/last_tool_result",
                    "value": result,
                })],
            });
        }
    }

    events.push(InternalEvent::StateDelta {
        patch_ops: vec![json!({ "op": "add", "path": "/turns", "value": turns })],
    });
    events
}

/// Split text into word chunks, keeping the separating whitespace on each chunk.
fn chunk_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
