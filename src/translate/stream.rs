//! Text message framing.
//!
//! At most one text message is open at a time. Any event that is not text for the
//! open message closes it first, and the run force-closes whatever is still open
//! before its terminal event.

use std::collections::BTreeSet;

use crate::engine::{InternalEvent, Role};
use crate::protocol::OutputEventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Started,
    Ended,
}

#[derive(Debug, Default)]
pub struct StreamIdentityTracker {
    phase: StreamPhase,
    current_message_id: Option<String>,
    long_running: BTreeSet<String>,
}

impl StreamIdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn current_message_id(&self) -> Option<&str> {
        self.current_message_id.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.phase == StreamPhase::Started
    }

    /// Framing events for `event`.
    ///
    /// Text events yield their full start/content/end framing. Every other event only
    /// yields the close of the open message, if any; the caller emits its own output
    /// after these.
    pub fn observe(&mut self, event: &InternalEvent) -> Vec<OutputEventKind> {
        match event {
            InternalEvent::TextDelta {
                role,
                message_id,
                text,
            } => self.on_delta(*role, message_id, text),
            InternalEvent::TextFinal {
                role,
                message_id,
                text,
            } => self.on_final(*role, message_id, text.as_deref()),
            _ => self.close_text().into_iter().collect(),
        }
    }

    /// Close the open message. Used before non-text output.
    pub fn close_text(&mut self) -> Option<OutputEventKind> {
        if self.phase != StreamPhase::Started {
            return None;
        }
        self.phase = StreamPhase::Ended;
        self.current_message_id
            .clone()
            .map(OutputEventKind::text_message_end)
    }

    /// Synthetic close at shutdown (finished, paused, errored or cancelled).
    pub fn force_close(&mut self) -> Option<OutputEventKind> {
        self.close_text()
    }

    pub fn record_long_running(&mut self, call_id: &str) {
        self.long_running.insert(call_id.to_string());
    }

    /// Long-running call ids seen in this run.
    pub fn long_running_ids(&self) -> impl Iterator<Item = &str> {
        self.long_running.iter().map(String::as_str)
    }

    fn is_open_for(&self, message_id: &str) -> bool {
        self.is_open() && self.current_message_id.as_deref() == Some(message_id)
    }

    fn open(&mut self, role: Role, message_id: &str, out: &mut Vec<OutputEventKind>) {
        out.extend(self.close_text());
        self.phase = StreamPhase::Started;
        self.current_message_id = Some(message_id.to_string());
        out.push(OutputEventKind::text_message_start(message_id, role));
    }

    fn on_delta(&mut self, role: Role, message_id: &str, text: &str) -> Vec<OutputEventKind> {
        let mut out = Vec::new();
        if text.is_empty() {
            return out;
        }
        if !self.is_open_for(message_id) {
            self.open(role, message_id, &mut out);
        }
        out.push(OutputEventKind::text_message_content(message_id, text));
        out
    }

    fn on_final(
        &mut self,
        role: Role,
        message_id: &str,
        text: Option<&str>,
    ) -> Vec<OutputEventKind> {
        let mut out = Vec::new();
        let text = text.filter(|t| !t.is_empty());
        if !self.is_open_for(message_id) {
            // A final for a message that never streamed only frames its own text.
            out.extend(self.close_text());
            let Some(text) = text else {
                return out;
            };
            self.open(role, message_id, &mut out);
            out.push(OutputEventKind::text_message_content(message_id, text));
        } else if let Some(text) = text {
            out.push(OutputEventKind::text_message_content(message_id, text));
        }
        out.extend(self.close_text());
        out
    }
}

/// Check text framing over an emitted sequence: content only inside an open bracket
/// for the same id, no nested brackets, nothing left open.
#[cfg(test)]
pub(crate) fn check_framing(events: &[OutputEventKind]) -> Result<(), String> {
    let mut open: Option<&str> = None;
    for (i, event) in events.iter().enumerate() {
        match event {
            OutputEventKind::TextMessageStart { message_id, .. } => {
                if let Some(current) = open {
                    return Err(format!("#{i}: start {message_id} while {current} open"));
                }
                open = Some(message_id);
            }
            OutputEventKind::TextMessageContent { message_id, .. } => {
                if open != Some(message_id.as_str()) {
                    return Err(format!("#{i}: content for {message_id} outside its bracket"));
                }
            }
            OutputEventKind::TextMessageEnd { message_id } => {
                if open != Some(message_id.as_str()) {
                    return Err(format!("#{i}: end for {message_id} which is not open"));
                }
                open = None;
            }
            OutputEventKind::ToolCall { .. }
            | OutputEventKind::ToolResult { .. }
            | OutputEventKind::StateDelta { .. }
            | OutputEventKind::StateSnapshot { .. }
            | OutputEventKind::Thinking { .. }
            | OutputEventKind::RunFinished { .. }
            | OutputEventKind::RunError { .. } => {
                if let Some(current) = open {
                    return Err(format!("#{i}: {} while {current} open", event.event_name()));
                }
            }
            OutputEventKind::RunStarted { .. } | OutputEventKind::Custom { .. } => {}
        }
    }
    match open {
        Some(current) => Err(format!("{current} left open")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn run(tracker: &mut StreamIdentityTracker, events: &[InternalEvent]) -> Vec<OutputEventKind> {
        let mut out: Vec<_> = events.iter().flat_map(|e| tracker.observe(e)).collect();
        out.extend(tracker.force_close());
        out
    }

    #[test]
    fn deltas_then_final_form_one_bracket() {
        let mut tracker = StreamIdentityTracker::new();
        let mut out = tracker.observe(&InternalEvent::text_delta("m1", "Hi"));
        assert_eq!(tracker.current_message_id(), Some("m1"));
        out.extend(run(
            &mut tracker,
            &[
                InternalEvent::text_delta("m1", " there"),
                InternalEvent::text_final("m1"),
            ],
        ));
        assert_eq!(
            out,
            vec![
                OutputEventKind::text_message_start("m1", Role::Assistant),
                OutputEventKind::text_message_content("m1", "Hi"),
                OutputEventKind::text_message_content("m1", " there"),
                OutputEventKind::text_message_end("m1"),
            ]
        );
        assert_eq!(tracker.phase(), StreamPhase::Ended);
    }

    #[test]
    fn switching_message_closes_previous() {
        let mut tracker = StreamIdentityTracker::new();
        let out = run(
            &mut tracker,
            &[
                InternalEvent::text_delta("m1", "a"),
                InternalEvent::text_delta("m2", "b"),
            ],
        );
        assert_eq!(
            out,
            vec![
                OutputEventKind::text_message_start("m1", Role::Assistant),
                OutputEventKind::text_message_content("m1", "a"),
                OutputEventKind::text_message_end("m1"),
                OutputEventKind::text_message_start("m2", Role::Assistant),
                OutputEventKind::text_message_content("m2", "b"),
                OutputEventKind::text_message_end("m2"),
            ]
        );
    }

    #[test]
    fn non_text_event_closes_open_message() {
        let mut tracker = StreamIdentityTracker::new();
        tracker.observe(&InternalEvent::text_delta("m1", "thinking about it"));
        let out = tracker.observe(&InternalEvent::tool_call("c1", "search", json!({}), false));
        assert_eq!(out, vec![OutputEventKind::text_message_end("m1")]);
        assert!(!tracker.is_open());
        assert!(tracker.force_close().is_none());
    }

    #[test]
    fn empty_delta_opens_nothing() {
        let mut tracker = StreamIdentityTracker::new();
        assert!(tracker.observe(&InternalEvent::text_delta("m1", "")).is_empty());
        assert_eq!(tracker.phase(), StreamPhase::Idle);
    }

    #[test]
    fn final_with_text_for_unstarted_message_is_complete_bracket() {
        let mut tracker = StreamIdentityTracker::new();
        let out = tracker.observe(&InternalEvent::TextFinal {
            role: Role::Assistant,
            message_id: "m1".into(),
            text: Some("done".into()),
        });
        assert_eq!(
            out,
            vec![
                OutputEventKind::text_message_start("m1", Role::Assistant),
                OutputEventKind::text_message_content("m1", "done"),
                OutputEventKind::text_message_end("m1"),
            ]
        );
        assert!(tracker.observe(&InternalEvent::text_final("m2")).is_empty());
    }

    #[test]
    fn final_for_other_message_closes_open_one() {
        let mut tracker = StreamIdentityTracker::new();
        tracker.observe(&InternalEvent::text_delta("m1", "a"));
        let out = tracker.observe(&InternalEvent::text_final("m2"));
        assert_eq!(out, vec![OutputEventKind::text_message_end("m1")]);
    }

    #[test]
    fn long_running_ids_are_recorded() {
        let mut tracker = StreamIdentityTracker::new();
        tracker.record_long_running("b");
        tracker.record_long_running("a");
        tracker.record_long_running("a");
        assert_eq!(tracker.long_running_ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    fn random_event(rng: &mut StdRng) -> InternalEvent {
        let id = format!("m{}", rng.gen_range(0..3));
        match rng.gen_range(0..7) {
            0 | 1 => InternalEvent::text_delta(id, if rng.gen_bool(0.2) { "" } else { "x" }),
            2 => InternalEvent::TextFinal {
                role: Role::Assistant,
                message_id: id,
                text: rng.gen_bool(0.5).then(|| "tail".to_string()),
            },
            3 => InternalEvent::tool_call(format!("c{}", rng.gen_range(0..10)), "t", json!({}), false),
            4 => InternalEvent::tool_result(format!("c{}", rng.gen_range(0..10)), json!(1)),
            5 => InternalEvent::StateDelta {
                patch_ops: vec![json!({"op": "add", "path": "/k", "value": 1})],
            },
            _ => InternalEvent::Thought { text: "hm".into() },
        }
    }

    #[test]
    fn framing_holds_over_generated_sequences() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let len = rng.gen_range(0..30);
            let events: Vec<_> = (0..len).map(|_| random_event(&mut rng)).collect();
            let mut tracker = StreamIdentityTracker::new();
            let mut out = Vec::new();
            for event in &events {
                out.extend(tracker.observe(event));
                if !event.is_text() {
                    // stand-in for the event's own non-text output
                    out.push(OutputEventKind::StateDelta { patch_ops: vec![] });
                }
            }
            out.extend(tracker.force_close());
            if let Err(reason) = check_framing(&out) {
                panic!("framing violated for {events:?}: {reason}");
            }
        }
    }
}
