//! Engine event to client protocol translation.

pub mod hooks;
pub mod stream;
pub mod translator;

pub use hooks::{EventFilter, RunHooks, StateTransformer, TranslatorOverride};
pub use stream::{StreamIdentityTracker, StreamPhase};
pub use translator::{EventTranslator, Translated, TranslatorOptions};
