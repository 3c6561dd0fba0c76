//! Session orchestration: admission, pending tool calls and the run state machine.

pub mod error;
pub mod guard;
mod key;
pub mod orchestrator;
pub mod pending;
pub mod sink;

pub use error::{AdmissionError, ResumeError, RunError, TranslationError};
pub use guard::{SessionConcurrencyGuard, SessionLock};
pub use key::SessionKey;
pub use orchestrator::{
    EventTimeoutPolicy, RunConfig, RunContext, RunInput, RunPhase, RunReport, RunRequest,
    RunTermination, SessionOrchestrator, TimeoutAction, TranslationErrorPolicy,
};
pub use pending::{PendingToolCall, PendingToolRegistry};
pub use sink::{EventSink, SinkClosed};
