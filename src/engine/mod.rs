//! Execution engine seam.
//!
//! An engine turns one run request into an ordered stream of [`InternalEvent`]s.
//! Engines are registered per application in an [`EngineRegistry`].

pub mod echo;
pub mod events;
pub mod registry;
pub mod scripted;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::SessionKey;
use crate::store::HistoryEntry;

pub use events::{EngineFatalError, EngineItem, InternalEvent, Role};
pub use registry::{EngineInfo, EngineRegistry};

/// What the engine is asked to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    /// Fresh user input.
    UserMessage { content: String },
    /// Result for a previously paused long-running tool call.
    ToolResult {
        call_id: String,
        tool_name: String,
        result: Value,
        is_error: bool,
    },
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub key: SessionKey,
    pub run_id: String,
    pub input: EngineInput,
    /// Conversation state as loaded at the start of the run.
    pub state: Value,
    pub history: Vec<HistoryEntry>,
}

/// A started engine execution.
pub struct EngineRun {
    pub events: mpsc::Receiver<EngineItem>,
    pub handle: JoinHandle<()>,
}

impl EngineRun {
    pub fn new(events: mpsc::Receiver<EngineItem>, handle: JoinHandle<()>) -> Self {
        Self { events, handle }
    }

    /// Stop the engine task and drop any undelivered events.
    pub fn cancel(mut self) {
        self.events.close();
        self.handle.abort();
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    async fn start(&self, request: EngineRequest) -> Result<EngineRun, EngineFatalError>;
}
