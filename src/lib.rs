//! # AG-UI Bridge
//!
//! Serves agent execution engines to AG-UI clients over Server-Sent Events.
//!
//! Each run request is admitted under an exclusive per-conversation lock, forwarded
//! to the application's engine, and the engine's internal events are translated into
//! a well-framed AG-UI event stream. Long-running tool calls pause the run; the next
//! request carrying the tool result resumes it.
//!
//! ```text
//!   client ──POST──▶ api::run ──▶ SessionOrchestrator ──▶ ExecutionEngine
//!      ▲                               │      ▲                  │
//!      └──────────── SSE ◀── EventSink ┘      └── InternalEvent ─┘
//!                                      │
//!                                      ▼
//!                              ConversationStore
//! ```
//!
//! ## Modules
//! - `api`: HTTP routes and SSE streaming
//! - `engine`: execution engine seam, registry and built-in engines
//! - `protocol`: AG-UI output events
//! - `session`: admission, pending tool calls and the run orchestrator
//! - `store`: conversation persistence (memory, file, sqlite)
//! - `translate`: internal-to-output event translation and run hooks

pub mod api;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod session;
pub mod store;
pub mod translate;
pub mod util;

pub use config::Config;
