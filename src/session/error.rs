//! Run error taxonomy.
//!
//! Every variant maps to a stable code carried on the terminal `RUN_ERROR` event.

use std::time::Duration;

use thiserror::Error;

use super::SessionKey;
use crate::engine::EngineFatalError;
use crate::store::StoreError;

/// The session is already running. Clients should retry later.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("session busy")]
    Busy { key: SessionKey, waited: Duration },
}

/// An internal event could not be mapped onto the output protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("unrecognized engine event '{kind}'")]
    Unrecognized { kind: String },
    #[error("malformed {kind} event: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// The inbound request cannot resume this conversation. Client input error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResumeError {
    #[error("tool call '{call_id}' is not pending for this conversation")]
    UnknownToolCall { call_id: String },
    #[error("request carries no user message or tool result")]
    NoInput,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Resume(#[from] ResumeError),
    #[error(transparent)]
    EngineFatal(#[from] EngineFatalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    /// Code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            RunError::Admission(_) => "SESSION_BUSY",
            RunError::Translation(_) => "TRANSLATION_ERROR",
            RunError::Resume(ResumeError::UnknownToolCall { .. }) => "UNKNOWN_TOOL_CALL",
            RunError::Resume(ResumeError::NoInput) => "INVALID_INPUT",
            RunError::EngineFatal(err) if err.timed_out => "ENGINE_TIMEOUT",
            RunError::EngineFatal(_) => "ENGINE_FAILURE",
            RunError::Store(_) => "STORE_ERROR",
            RunError::Cancelled => "CANCELLED",
        }
    }

    /// Whether the fault lies with the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, RunError::Admission(_) | RunError::Resume(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let busy = RunError::from(AdmissionError::Busy {
            key: SessionKey::new("a", "u", "c"),
            waited: Duration::ZERO,
        });
        assert_eq!(busy.code(), "SESSION_BUSY");
        assert_eq!(busy.to_string(), "session busy");
        assert!(busy.is_client_error());

        let unknown = RunError::from(ResumeError::UnknownToolCall {
            call_id: "X".into(),
        });
        assert_eq!(unknown.code(), "UNKNOWN_TOOL_CALL");
        assert!(unknown.is_client_error());

        let timeout = RunError::from(EngineFatalError::timeout("no event for 5s"));
        assert_eq!(timeout.code(), "ENGINE_TIMEOUT");
        assert!(!timeout.is_client_error());
    }
}
