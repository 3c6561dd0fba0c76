//! Drives one run from admission to its terminal event.
//!
//! ```text
//! Init -> Locking -> Resuming -> Dispatching -> Streaming -> Pausing    -> Closed
//!                                                         \-> Finalizing -> Closed
//!      (any non-terminal phase) -> Erroring -> Closed
//! ```
//!
//! The first event on the sink is always `RUN_STARTED` and the last is exactly one of
//! `RUN_FINISHED` / `RUN_ERROR`. The session lock is held from `Locking` until
//! `Closed` and is released on every path.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{ResumeError, RunError};
use super::pending::{PendingToolCall, PendingToolRegistry};
use super::sink::{EventSink, SinkClosed};
use super::{SessionConcurrencyGuard, SessionKey};
use crate::engine::{
    EngineFatalError, EngineInput, EngineItem, EngineRequest, EngineRun, ExecutionEngine,
    InternalEvent,
};
use crate::protocol::{EventClock, OutputEventKind, RunOutcome};
use crate::store::{ConversationState, ConversationStore, HistoryEntry, StatePatch};
use crate::translate::{EventTranslator, RunHooks, Translated, TranslatorOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Locking,
    Resuming,
    Dispatching,
    Streaming,
    Pausing,
    Finalizing,
    Erroring,
    Closed,
}

/// What the client sent to start or resume the run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunInput {
    UserMessage {
        content: String,
    },
    /// Result for a long-running tool call a previous run paused on.
    ToolResult {
        call_id: String,
        result: Value,
        is_error: bool,
    },
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub key: SessionKey,
    pub thread_id: String,
    pub run_id: String,
    /// `None` when the request carried nothing usable.
    pub input: Option<RunInput>,
    /// Client state merged into the conversation state (top-level keys).
    pub client_state: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutAction {
    /// Emit an `engine_idle` custom event and keep waiting.
    #[default]
    Continue,
    /// Fail the run with `ENGINE_TIMEOUT`.
    Abort,
}

/// Bound on the wait for each engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTimeoutPolicy {
    pub timeout: Duration,
    pub on_timeout: TimeoutAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranslationErrorPolicy {
    #[default]
    Abort,
    /// Log, emit a `translation_error` custom event and keep going.
    Skip,
}

impl TranslationErrorPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Some(Self::Abort),
            "skip" | "continue" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Zero rejects immediately when the session is busy.
    pub lock_timeout: Duration,
    pub event_timeout: Option<EventTimeoutPolicy>,
    pub translation_errors: TranslationErrorPolicy,
    pub emit_thoughts: bool,
}

/// Collaborators for a run. Cheap to clone; one per request.
#[derive(Clone)]
pub struct RunContext {
    pub guard: SessionConcurrencyGuard,
    pub store: Arc<dyn ConversationStore>,
    pub engine: Arc<dyn ExecutionEngine>,
    pub hooks: RunHooks,
    pub config: RunConfig,
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunTermination {
    Finished(RunOutcome),
    Errored { code: &'static str, message: String },
}

impl RunTermination {
    pub fn is_error(&self) -> bool {
        matches!(self, RunTermination::Errored { .. })
    }

    pub fn code(&self) -> Option<&'static str> {
        match self {
            RunTermination::Errored { code, .. } => Some(*code),
            RunTermination::Finished(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub phase_history: Vec<RunPhase>,
    pub outcome: RunTermination,
    pub pending: Vec<PendingToolCall>,
    pub events_emitted: usize,
}

/// Everything a run owns once the conversation is loaded.
struct LiveRun {
    conversation: ConversationState,
    pending: PendingToolRegistry,
    translator: EventTranslator,
    state_merge: Option<Map<String, Value>>,
    inbound_history: Vec<HistoryEntry>,
    engine: Option<EngineRun>,
    streaming: bool,
}

impl LiveRun {
    fn stop_engine(&mut self) {
        if let Some(run) = self.engine.take() {
            run.cancel();
        }
    }

    /// Patch for what the run produced so far. State changes are left out when the
    /// run failed.
    fn take_patch(&mut self, include_state: bool) -> StatePatch {
        let mut history = std::mem::take(&mut self.inbound_history);
        history.extend(self.translator.take_history());
        let (state_delta, state_merge) = if include_state {
            (self.translator.take_state_ops(), self.state_merge.take())
        } else {
            (Vec::new(), None)
        };
        StatePatch {
            state_delta,
            state_merge,
            pending_tools: Some(self.pending.snapshot()),
            append_history: history,
        }
    }
}

enum Next {
    Item(EngineItem),
    Exhausted,
    TimedOut(Duration),
    Cancelled,
}

/// Why streaming stopped early.
enum Interrupt {
    Failed(RunError),
    Disconnected,
}

impl From<SinkClosed> for Interrupt {
    fn from(_: SinkClosed) -> Self {
        Interrupt::Disconnected
    }
}

async fn recv_next(
    events: &mut mpsc::Receiver<EngineItem>,
    policy: Option<EventTimeoutPolicy>,
) -> Next {
    let item = match policy {
        None => events.recv().await,
        Some(policy) => match tokio::time::timeout(policy.timeout, events.recv()).await {
            Ok(item) => item,
            Err(_) => return Next::TimedOut(policy.timeout),
        },
    };
    match item {
        Some(item) => Next::Item(item),
        None => Next::Exhausted,
    }
}

/// Items the engine has already produced, without waiting for more.
fn drain_buffered(run: &mut EngineRun) -> Vec<EngineItem> {
    let mut items = Vec::new();
    while let Ok(item) = run.events.try_recv() {
        items.push(item);
    }
    items
}

pub struct SessionOrchestrator {
    ctx: RunContext,
    request: RunRequest,
    phase_history: Vec<RunPhase>,
    clock: EventClock,
    events_emitted: usize,
    started: bool,
    terminal_sent: bool,
    sink_closed: bool,
    final_pending: Vec<PendingToolCall>,
}

impl SessionOrchestrator {
    pub fn new(ctx: RunContext, request: RunRequest) -> Self {
        Self {
            ctx,
            request,
            phase_history: vec![RunPhase::Init],
            clock: EventClock::new(),
            events_emitted: 0,
            started: false,
            terminal_sent: false,
            sink_closed: false,
            final_pending: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase_history
            .last()
            .copied()
            .unwrap_or(RunPhase::Init)
    }

    /// Run to completion. Never panics on engine, store or client failures; those end
    /// the run with a `RUN_ERROR` event and an errored report.
    pub async fn run(mut self, sink: &dyn EventSink, cancel: CancellationToken) -> RunReport {
        let key = self.request.key.clone();
        self.enter(RunPhase::Locking);

        let outcome = match self.ctx.guard.acquire(&key, self.ctx.config.lock_timeout).await {
            Ok(lock) => {
                let outcome = self.drive(sink, &cancel).await;
                self.ctx.guard.release(lock);
                outcome
            }
            Err(err) => self.fail(sink, None, err.into()).await,
        };

        self.enter(RunPhase::Closed);
        info!(
            session = %key,
            run_id = %self.request.run_id,
            events = self.events_emitted,
            outcome = ?outcome,
            "run closed"
        );

        RunReport {
            run_id: self.request.run_id,
            phase_history: self.phase_history,
            outcome,
            pending: self.final_pending,
            events_emitted: self.events_emitted,
        }
    }

    /// Everything between admission and lock release.
    async fn drive(&mut self, sink: &dyn EventSink, cancel: &CancellationToken) -> RunTermination {
        self.enter(RunPhase::Resuming);
        let (mut live, input) = match self.resume().await {
            Ok(resumed) => resumed,
            Err(err) => return self.fail(sink, None, err).await,
        };

        self.enter(RunPhase::Dispatching);
        let started = OutputEventKind::run_started(&self.request.thread_id, &self.request.run_id);
        if self.emit(sink, started).await.is_err() {
            return self.fail(sink, Some(&mut live), RunError::Cancelled).await;
        }

        let request = EngineRequest {
            key: self.request.key.clone(),
            run_id: self.request.run_id.clone(),
            input,
            state: live.conversation.state.clone(),
            history: live.conversation.history.clone(),
        };
        match self.ctx.engine.start(request).await {
            Ok(run) => live.engine = Some(run),
            Err(err) => return self.fail(sink, Some(&mut live), err.into()).await,
        }

        self.enter(RunPhase::Streaming);
        live.streaming = true;

        loop {
            let next = {
                let Some(run) = live.engine.as_mut() else {
                    break;
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Next::Cancelled,
                    next = recv_next(&mut run.events, self.ctx.config.event_timeout) => next,
                }
            };

            let step = match next {
                Next::Item(Ok(event)) => self.process(sink, &mut live, event).await,
                Next::Item(Err(fatal)) => Err(Interrupt::Failed(fatal.into())),
                Next::Exhausted => break,
                Next::Cancelled => Err(Interrupt::Disconnected),
                Next::TimedOut(waited) => self.on_idle(sink, waited).await.map(|()| false),
            };

            match step {
                Ok(false) => continue,
                Ok(true) => return self.pause(sink, &mut live, true).await,
                Err(Interrupt::Failed(err)) => return self.fail(sink, Some(&mut live), err).await,
                Err(Interrupt::Disconnected) => {
                    return self.fail(sink, Some(&mut live), RunError::Cancelled).await
                }
            }
        }

        self.finalize(sink, &mut live).await
    }

    /// Load the conversation and classify the input. Nothing is written here; a
    /// rejected submission leaves the stored conversation untouched.
    async fn resume(&mut self) -> Result<(LiveRun, EngineInput), RunError> {
        let key = &self.request.key;
        let client_state = self.request.client_state.clone();
        let mut conversation = match &self.request.input {
            None => return Err(ResumeError::NoInput.into()),
            // A submission can only target a conversation that already exists.
            Some(RunInput::ToolResult { call_id, .. }) => match self.ctx.store.get(key).await? {
                Some(conversation) => conversation,
                None => {
                    warn!(session = %key, call_id = %call_id, "tool result for an unknown conversation");
                    return Err(ResumeError::UnknownToolCall {
                        call_id: call_id.clone(),
                    }
                    .into());
                }
            },
            Some(RunInput::UserMessage { .. }) => {
                let initial = client_state.clone().unwrap_or_else(|| json!({}));
                self.ctx.store.get_or_create(key, initial).await?
            }
        };
        let mut pending = PendingToolRegistry::load(&conversation);

        let state_merge = match client_state {
            Some(Value::Object(map)) if !map.is_empty() => Some(map),
            _ => None,
        };
        if let (Some(merge), Value::Object(state)) = (&state_merge, &mut conversation.state) {
            state.extend(merge.clone());
        }

        let mut inbound_history = Vec::new();
        let input = match self.request.input.clone() {
            None => return Err(ResumeError::NoInput.into()),
            Some(RunInput::UserMessage { content }) => {
                inbound_history.push(HistoryEntry::user(content.clone()));
                EngineInput::UserMessage { content }
            }
            Some(RunInput::ToolResult {
                call_id,
                result,
                is_error,
            }) => {
                let Some(call) = pending.get(&call_id).cloned() else {
                    warn!(
                        session = %key,
                        call_id = %call_id,
                        pending = pending.len(),
                        "tool result for a call that is not pending"
                    );
                    self.final_pending = pending.list_pending();
                    return Err(ResumeError::UnknownToolCall { call_id }.into());
                };
                pending.resolve(&call_id);
                info!(session = %key, call_id = %call_id, tool = %call.tool_name, "resuming with tool result");
                inbound_history.push(HistoryEntry::tool_result(
                    &call_id,
                    Some(&call.tool_name),
                    &result,
                ));
                EngineInput::ToolResult {
                    call_id,
                    tool_name: call.tool_name,
                    result,
                    is_error,
                }
            }
        };

        let translator = EventTranslator::new(TranslatorOptions {
            emit_thoughts: self.ctx.config.emit_thoughts,
        });
        Ok((
            LiveRun {
                conversation,
                pending,
                translator,
                state_merge,
                inbound_history,
                engine: None,
                streaming: false,
            },
            input,
        ))
    }

    /// Translate and forward one engine event. `Ok(true)` asks for a pause.
    async fn process(
        &mut self,
        sink: &dyn EventSink,
        live: &mut LiveRun,
        event: InternalEvent,
    ) -> Result<bool, Interrupt> {
        if !self.ctx.hooks.accepts(&event) {
            debug!(event = event.kind_name(), "event filtered");
            return Ok(false);
        }

        let translated = match self.ctx.hooks.override_for(&event) {
            Some(events) => live.translator.overridden(&event, events, &mut live.pending),
            None => match live.translator.translate(&event, &mut live.pending) {
                Ok(translated) => translated,
                Err(err) => match self.ctx.config.translation_errors {
                    TranslationErrorPolicy::Abort => {
                        return Err(Interrupt::Failed(err.into()));
                    }
                    TranslationErrorPolicy::Skip => {
                        warn!(
                            run_id = %self.request.run_id,
                            event = event.kind_name(),
                            error = %err,
                            "skipping untranslatable event"
                        );
                        Translated {
                            events: vec![OutputEventKind::custom(
                                "translation_error",
                                json!({ "kind": event.kind_name(), "message": err.to_string() }),
                            )],
                            pause: false,
                        }
                    }
                },
            },
        };

        for kind in translated.events {
            self.emit(sink, kind).await?;
        }
        Ok(translated.pause)
    }

    async fn on_idle(&mut self, sink: &dyn EventSink, waited: Duration) -> Result<(), Interrupt> {
        let waited_ms = waited.as_millis() as u64;
        let on_timeout = self
            .ctx
            .config
            .event_timeout
            .map(|p| p.on_timeout)
            .unwrap_or_default();
        match on_timeout {
            TimeoutAction::Continue => {
                debug!(run_id = %self.request.run_id, waited_ms, "engine idle");
                self.emit(
                    sink,
                    OutputEventKind::custom("engine_idle", json!({ "waitedMs": waited_ms })),
                )
                .await?;
                Ok(())
            }
            TimeoutAction::Abort => Err(Interrupt::Failed(RunError::EngineFatal(
                EngineFatalError::timeout(format!("no engine event within {waited_ms}ms")),
            ))),
        }
    }

    /// Stop for long-running tool calls. With `flush`, events the engine already
    /// produced are forwarded before it is cancelled.
    async fn pause(&mut self, sink: &dyn EventSink, live: &mut LiveRun, flush: bool) -> RunTermination {
        self.enter(RunPhase::Pausing);

        if flush {
            let buffered = live.engine.as_mut().map(drain_buffered).unwrap_or_default();
            if !buffered.is_empty() {
                debug!(run_id = %self.request.run_id, count = buffered.len(), "flushing buffered events");
            }
            for item in buffered {
                let step = match item {
                    Ok(event) => self.process(sink, live, event).await.map(|_| ()),
                    Err(fatal) => Err(Interrupt::Failed(fatal.into())),
                };
                match step {
                    Ok(()) => {}
                    Err(Interrupt::Failed(err)) => return self.fail(sink, Some(live), err).await,
                    Err(Interrupt::Disconnected) => {
                        return self.fail(sink, Some(live), RunError::Cancelled).await
                    }
                }
            }
        }
        live.stop_engine();

        if live.pending.is_empty() {
            debug!(run_id = %self.request.run_id, "pause resolved by flushed events");
            return self.complete(sink, live).await;
        }

        if let Some(end) = live.translator.force_close() {
            if self.emit(sink, end).await.is_err() {
                return self.fail(sink, Some(live), RunError::Cancelled).await;
            }
        }

        let patch = live.take_patch(true);
        if let Err(err) = self.ctx.store.save(&self.request.key, patch).await {
            return self.fail(sink, Some(live), err.into()).await;
        }

        let pending = live.pending.list_pending();
        info!(
            session = %self.request.key,
            run_id = %self.request.run_id,
            pending = pending.len(),
            "run interrupted for long-running tool calls"
        );
        self.final_pending = pending.clone();

        let outcome = RunOutcome::Interrupted { pending };
        let finished = OutputEventKind::run_finished(
            &self.request.thread_id,
            &self.request.run_id,
            outcome.clone(),
        );
        if self.emit(sink, finished).await.is_err() {
            debug!(run_id = %self.request.run_id, "client gone before RUN_FINISHED");
        }
        RunTermination::Finished(outcome)
    }

    /// Engine exhausted.
    async fn finalize(&mut self, sink: &dyn EventSink, live: &mut LiveRun) -> RunTermination {
        // drained; the task has nothing left to send
        live.engine = None;

        if !live.pending.is_empty() {
            debug!(
                run_id = %self.request.run_id,
                pending = live.pending.len(),
                "engine finished with unresolved long-running calls"
            );
            return self.pause(sink, live, false).await;
        }
        self.complete(sink, live).await
    }

    /// Snapshot, persist and report success.
    async fn complete(&mut self, sink: &dyn EventSink, live: &mut LiveRun) -> RunTermination {
        self.enter(RunPhase::Finalizing);
        if let Some(end) = live.translator.force_close() {
            if self.emit(sink, end).await.is_err() {
                return self.fail(sink, Some(live), RunError::Cancelled).await;
            }
        }

        let mut patch = live.take_patch(true);
        if !self.ctx.hooks.is_empty() {
            let mut preview = live.conversation.clone();
            patch.clone().apply_to(&mut preview);
            let transformed = self.ctx.hooks.transform_state(&self.request.key, preview.state.clone());
            if transformed != preview.state {
                patch.state_merge = None;
                patch.state_delta = vec![json!({ "op": "replace", "path": "", "value": transformed })];
            }
        }

        let saved = match self.ctx.store.save(&self.request.key, patch).await {
            Ok(saved) => saved,
            Err(err) => return self.fail(sink, Some(live), err.into()).await,
        };

        let snapshot = OutputEventKind::StateSnapshot {
            snapshot: saved.state,
        };
        if self.emit(sink, snapshot).await.is_err() {
            return self.fail(sink, Some(live), RunError::Cancelled).await;
        }

        let outcome = RunOutcome::Success;
        let finished = OutputEventKind::run_finished(
            &self.request.thread_id,
            &self.request.run_id,
            outcome.clone(),
        );
        if self.emit(sink, finished).await.is_err() {
            debug!(run_id = %self.request.run_id, "client gone before RUN_FINISHED");
        }
        RunTermination::Finished(outcome)
    }

    /// Error path: close text, stop the engine, keep pending calls, report once.
    async fn fail(
        &mut self,
        sink: &dyn EventSink,
        live: Option<&mut LiveRun>,
        err: RunError,
    ) -> RunTermination {
        self.enter(RunPhase::Erroring);
        let code = err.code();
        let message = err.to_string();

        match &err {
            RunError::Cancelled => {
                info!(session = %self.request.key, run_id = %self.request.run_id, "run cancelled")
            }
            err if err.is_client_error() => {
                warn!(session = %self.request.key, run_id = %self.request.run_id, code, error = %err, "run rejected")
            }
            err => {
                error!(session = %self.request.key, run_id = %self.request.run_id, code, error = %err, "run failed")
            }
        }

        if let Some(live) = live {
            live.stop_engine();
            if let Some(end) = live.translator.force_close() {
                let _ = self.emit(sink, end).await;
            }
            if live.streaming {
                let patch = live.take_patch(false);
                if let Err(store_err) = self.ctx.store.save(&self.request.key, patch).await {
                    warn!(
                        session = %self.request.key,
                        error = %store_err,
                        "failed to persist pending tool calls after error"
                    );
                }
            }
            self.final_pending = live.pending.list_pending();
        }

        if !self.terminal_sent {
            let _ = self
                .emit(sink, OutputEventKind::run_error(message.clone(), Some(code)))
                .await;
        }
        RunTermination::Errored { code, message }
    }

    /// Stamp and send. `RUN_STARTED` is sent first if it has not been yet, and
    /// nothing follows a terminal event.
    async fn emit(&mut self, sink: &dyn EventSink, kind: OutputEventKind) -> Result<(), SinkClosed> {
        if self.sink_closed {
            return Err(SinkClosed);
        }
        if self.terminal_sent {
            debug!(event = kind.event_name(), "dropping event after terminal");
            return Ok(());
        }
        let is_started = matches!(kind, OutputEventKind::RunStarted { .. });
        if is_started && self.started {
            return Ok(());
        }
        if !is_started && !self.started {
            let started = OutputEventKind::run_started(&self.request.thread_id, &self.request.run_id);
            self.deliver(sink, started).await?;
        }
        if kind.is_terminal() {
            self.terminal_sent = true;
        }
        self.deliver(sink, kind).await
    }

    async fn deliver(&mut self, sink: &dyn EventSink, kind: OutputEventKind) -> Result<(), SinkClosed> {
        if matches!(kind, OutputEventKind::RunStarted { .. }) {
            self.started = true;
        }
        let event = self.clock.stamp(kind);
        match sink.send(event).await {
            Ok(()) => {
                self.events_emitted += 1;
                Ok(())
            }
            Err(closed) => {
                self.sink_closed = true;
                Err(closed)
            }
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(run_id = %self.request.run_id, ?phase, "run phase");
        self.phase_history.push(phase);
    }
}
