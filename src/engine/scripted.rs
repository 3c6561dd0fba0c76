//! Engine that replays prepared event sequences.
//!
//! Used by tests and for wiring fixed agent behaviors to an application without a
//! model behind it.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{EngineFatalError, EngineItem, EngineRequest, EngineRun, ExecutionEngine, InternalEvent};

/// One prepared engine execution.
#[derive(Debug, Clone, Default)]
pub struct Script {
    items: Vec<EngineItem>,
    delay: Duration,
    hold_open: bool,
}

impl Script {
    pub fn new(events: Vec<InternalEvent>) -> Self {
        Self {
            items: events.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }

    pub fn from_items(items: Vec<EngineItem>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    /// Sleep before every item.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep the stream open after the last item until the run is cancelled.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

pub struct ScriptedEngine {
    id: String,
    scripts: StdMutex<VecDeque<Script>>,
    repeat: Option<Script>,
    requests: StdMutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    /// Replay the same events on every run.
    pub fn new(events: Vec<InternalEvent>) -> Self {
        Self {
            id: "scripted".to_string(),
            scripts: StdMutex::new(VecDeque::new()),
            repeat: Some(Script::new(events)),
            requests: StdMutex::new(Vec::new()),
        }
    }

    /// Play one script per run, in order. Runs past the end see an empty stream.
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        Self {
            id: "scripted".to_string(),
            scripts: StdMutex::new(scripts.into()),
            repeat: None,
            requests: StdMutex::new(Vec::new()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<EngineRequest> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn next_script(&self) -> Script {
        let queued = match self.scripts.lock() {
            Ok(mut scripts) => scripts.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        queued
            .or_else(|| self.repeat.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    async fn start(&self, request: EngineRequest) -> Result<EngineRun, EngineFatalError> {
        let script = self.next_script();
        let run_id = request.run_id.clone();
        match self.requests.lock() {
            Ok(mut requests) => requests.push(request),
            Err(poisoned) => poisoned.into_inner().push(request),
        }

        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            for item in script.items {
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                if tx.send(item).await.is_err() {
                    debug!(run_id = %run_id, "scripted engine receiver dropped");
                    return;
                }
            }
            if script.hold_open {
                std::future::pending::<()>().await;
            }
        });

        Ok(EngineRun::new(rx, handle))
    }
}
