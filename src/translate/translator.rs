//! Maps engine events onto the client protocol.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::stream::StreamIdentityTracker;
use crate::engine::{InternalEvent, Role};
use crate::protocol::OutputEventKind;
use crate::session::{PendingToolRegistry, TranslationError};
use crate::store::HistoryEntry;

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslatorOptions {
    /// Forward `Thought` events as `THINKING`. Dropped otherwise.
    pub emit_thoughts: bool,
}

/// Output for one engine event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translated {
    pub events: Vec<OutputEventKind>,
    /// A long-running tool call was seen; the run should flush and pause.
    pub pause: bool,
}

/// Per-run translator. Owns the text framing state and collects what the run
/// produced for the conversation store.
#[derive(Debug, Default)]
pub struct EventTranslator {
    tracker: StreamIdentityTracker,
    options: TranslatorOptions,
    history: Vec<HistoryEntry>,
    /// message id -> index into `history`
    text_entries: HashMap<String, usize>,
    tool_names: HashMap<String, String>,
    state_ops: Vec<Value>,
}

impl EventTranslator {
    pub fn new(options: TranslatorOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn tracker(&self) -> &StreamIdentityTracker {
        &self.tracker
    }

    /// Translate one event. The registry is updated for long-running calls and for
    /// results of calls it holds.
    ///
    /// Validation happens before any state changes, so a rejected event leaves the
    /// translator and the registry untouched.
    pub fn translate(
        &mut self,
        event: &InternalEvent,
        pending: &mut PendingToolRegistry,
    ) -> Result<Translated, TranslationError> {
        validate(event)?;

        let mut out = Translated::default();
        match event {
            InternalEvent::TextDelta {
                role,
                message_id,
                text,
            } => {
                out.events = self.tracker.observe(event);
                self.record_text(*role, message_id, text);
            }
            InternalEvent::TextFinal {
                role,
                message_id,
                text,
            } => {
                out.events = self.tracker.observe(event);
                if let Some(text) = text {
                    self.record_text(*role, message_id, text);
                }
            }
            InternalEvent::ToolCallRequested {
                call_id,
                tool_name,
                arguments,
                is_long_running,
            } => {
                out.events = self.tracker.observe(event);
                out.events.push(OutputEventKind::ToolCall {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    arguments: arguments.clone(),
                    long_running: *is_long_running,
                });
                self.history
                    .push(HistoryEntry::tool_call(call_id, tool_name, arguments));
                self.tool_names.insert(call_id.clone(), tool_name.clone());

                if *is_long_running {
                    debug!(call_id = %call_id, tool = %tool_name, "long-running tool call, pausing");
                    pending.register(call_id, tool_name);
                    self.tracker.record_long_running(call_id);
                    out.pause = true;
                }
            }
            InternalEvent::ToolCallResult {
                call_id,
                result,
                is_error,
            } => {
                out.events = self.tracker.observe(event);
                out.events.push(OutputEventKind::ToolResult {
                    call_id: call_id.clone(),
                    result: result.clone(),
                    is_error: *is_error,
                });

                let tool_name = self
                    .tool_names
                    .get(call_id)
                    .cloned()
                    .or_else(|| pending.get(call_id).map(|c| c.tool_name.clone()));
                self.history.push(HistoryEntry::tool_result(
                    call_id,
                    tool_name.as_deref(),
                    result,
                ));

                if pending.resolve(call_id) {
                    debug!(call_id = %call_id, "pending tool call resolved by engine");
                }
            }
            InternalEvent::StateDelta { patch_ops } => {
                if patch_ops.is_empty() {
                    trace!("dropping empty state delta");
                    return Ok(out);
                }
                out.events = self.tracker.observe(event);
                out.events.push(OutputEventKind::StateDelta {
                    patch_ops: patch_ops.clone(),
                });
                self.state_ops.extend(patch_ops.iter().cloned());
            }
            InternalEvent::Thought { text } => {
                if !self.options.emit_thoughts {
                    trace!("dropping thought");
                    return Ok(out);
                }
                out.events = self.tracker.observe(event);
                out.events.push(OutputEventKind::Thinking {
                    delta: text.clone(),
                });
            }
            InternalEvent::Unknown { kind, .. } => {
                return Err(TranslationError::Unrecognized { kind: kind.clone() });
            }
        }
        Ok(out)
    }

    /// Output supplied by a translator override for `event`. Only the output is
    /// replaced: long-running calls still register and pause, results still resolve.
    pub fn overridden(
        &mut self,
        event: &InternalEvent,
        events: Vec<OutputEventKind>,
        pending: &mut PendingToolRegistry,
    ) -> Translated {
        let mut out = Translated::default();
        match event {
            InternalEvent::ToolCallRequested {
                call_id,
                tool_name,
                is_long_running: true,
                ..
            } if !call_id.is_empty() => {
                debug!(call_id = %call_id, tool = %tool_name, "overridden long-running tool call, pausing");
                pending.register(call_id, tool_name);
                self.tracker.record_long_running(call_id);
                out.pause = true;
            }
            InternalEvent::ToolCallResult { call_id, .. } => {
                pending.resolve(call_id);
            }
            _ => {}
        }
        out.events.extend(self.tracker.close_text());
        for kind in events {
            match kind {
                OutputEventKind::TextMessageStart { .. }
                | OutputEventKind::TextMessageContent { .. }
                | OutputEventKind::TextMessageEnd { .. }
                | OutputEventKind::RunStarted { .. }
                | OutputEventKind::RunFinished { .. }
                | OutputEventKind::RunError { .. } => {
                    warn!(
                        event = event.kind_name(),
                        dropped = kind.event_name(),
                        "override output not allowed, dropping"
                    );
                }
                other => out.events.push(other),
            }
        }
        out
    }

    /// Close the open text message, if any.
    pub fn force_close(&mut self) -> Option<OutputEventKind> {
        self.tracker.force_close()
    }

    /// History entries produced since the last call.
    pub fn take_history(&mut self) -> Vec<HistoryEntry> {
        self.text_entries.clear();
        std::mem::take(&mut self.history)
    }

    /// State operations forwarded since the last call.
    pub fn take_state_ops(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.state_ops)
    }

    fn record_text(&mut self, role: Role, message_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(&idx) = self.text_entries.get(message_id) {
            self.history[idx].content.push_str(text);
            return;
        }
        let mut entry = HistoryEntry::assistant(message_id, text);
        entry.role = role;
        self.text_entries
            .insert(message_id.to_string(), self.history.len());
        self.history.push(entry);
    }
}

fn validate(event: &InternalEvent) -> Result<(), TranslationError> {
    let malformed = |reason: &str| TranslationError::Malformed {
        kind: event.kind_name(),
        reason: reason.to_string(),
    };
    match event {
        InternalEvent::TextDelta { message_id, .. } | InternalEvent::TextFinal { message_id, .. }
            if message_id.is_empty() =>
        {
            Err(malformed("empty message id"))
        }
        InternalEvent::ToolCallRequested { call_id, .. }
        | InternalEvent::ToolCallResult { call_id, .. }
            if call_id.is_empty() =>
        {
            Err(malformed("empty call id"))
        }
        InternalEvent::ToolCallRequested { tool_name, .. } if tool_name.is_empty() => {
            Err(malformed("empty tool name"))
        }
        _ => Ok(()),
    }
}
