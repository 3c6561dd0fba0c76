//! Per-phase extension points for a run.
//!
//! Each phase has one narrow trait. Hooks are collected into [`RunHooks`] when the
//! run context is built and consulted in registration order.

use std::sync::Arc;

use serde_json::Value;

use crate::engine::InternalEvent;
use crate::protocol::OutputEventKind;
use crate::session::SessionKey;

/// Decides whether an engine event reaches the translator at all.
pub trait EventFilter: Send + Sync {
    fn accept(&self, event: &InternalEvent) -> bool;
}

/// Replaces the translated output for an event.
///
/// Returning `Some` replaces the event's output. Pending-tool bookkeeping still runs,
/// so a long-running call pauses the run either way. Text framing and run lifecycle
/// events in the replacement are dropped; the open text message is closed first.
pub trait TranslatorOverride: Send + Sync {
    fn translate(&self, event: &InternalEvent) -> Option<Vec<OutputEventKind>>;
}

/// Rewrites the final state before it is snapshotted and stored.
pub trait StateTransformer: Send + Sync {
    fn transform(&self, key: &SessionKey, state: Value) -> Value;
}

#[derive(Clone, Default)]
pub struct RunHooks {
    filters: Vec<Arc<dyn EventFilter>>,
    overrides: Vec<Arc<dyn TranslatorOverride>>,
    transformers: Vec<Arc<dyn StateTransformer>>,
}

impl RunHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Arc<dyn EventFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_override(mut self, hook: Arc<dyn TranslatorOverride>) -> Self {
        self.overrides.push(hook);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn StateTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// All filters must accept.
    pub fn accepts(&self, event: &InternalEvent) -> bool {
        self.filters.iter().all(|f| f.accept(event))
    }

    /// First override that claims the event.
    pub fn override_for(&self, event: &InternalEvent) -> Option<Vec<OutputEventKind>> {
        self.overrides.iter().find_map(|o| o.translate(event))
    }

    /// Transformers applied in order.
    pub fn transform_state(&self, key: &SessionKey, state: Value) -> Value {
        self.transformers
            .iter()
            .fold(state, |state, t| t.transform(key, state))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.overrides.is_empty() && self.transformers.is_empty()
    }
}

impl std::fmt::Debug for RunHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHooks")
            .field("filters", &self.filters.len())
            .field("overrides", &self.overrides.len())
            .field("transformers", &self.transformers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoThoughts;

    impl EventFilter for NoThoughts {
        fn accept(&self, event: &InternalEvent) -> bool {
            !matches!(event, InternalEvent::Thought { .. })
        }
    }

    struct RenameSearch;

    impl TranslatorOverride for RenameSearch {
        fn translate(&self, event: &InternalEvent) -> Option<Vec<OutputEventKind>> {
            match event {
                InternalEvent::ToolCallRequested { tool_name, .. } if tool_name == "search" => {
                    Some(vec![OutputEventKind::custom("search", json!(null))])
                }
                _ => None,
            }
        }
    }

    struct Stamp(&'static str);

    impl StateTransformer for Stamp {
        fn transform(&self, _key: &SessionKey, mut state: Value) -> Value {
            state[self.0] = json!(true);
            state
        }
    }

    #[test]
    fn hooks_compose_in_order() {
        let hooks = RunHooks::new()
            .with_filter(Arc::new(NoThoughts))
            .with_override(Arc::new(RenameSearch))
            .with_transformer(Arc::new(Stamp("a")))
            .with_transformer(Arc::new(Stamp("b")));

        assert!(!hooks.accepts(&InternalEvent::Thought { text: "x".into() }));
        assert!(hooks.accepts(&InternalEvent::text_delta("m1", "x")));
        assert!(hooks
            .override_for(&InternalEvent::tool_call("c1", "search", json!({}), false))
            .is_some());
        assert!(hooks
            .override_for(&InternalEvent::tool_call("c1", "fetch", json!({}), false))
            .is_none());

        let key = SessionKey::new("app", "u", "c");
        assert_eq!(
            hooks.transform_state(&key, json!({})),
            json!({"a": true, "b": true})
        );
    }

    #[test]
    fn empty_hooks_pass_everything_through() {
        let hooks = RunHooks::default();
        assert!(hooks.is_empty());
        assert!(hooks.accepts(&InternalEvent::Thought { text: "x".into() }));
        let key = SessionKey::new("app", "u", "c");
        assert_eq!(hooks.transform_state(&key, json!({"k": 1})), json!({"k": 1}));
    }
}
