//! HTTP API for the AG-UI bridge.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/apps` - List registered applications
//! - `POST /api/run` - Run the default application, streaming AG-UI events via SSE
//! - `POST /api/apps/{app}/run` - Run a named application
//! - `GET /api/apps/{app}/conversations` - List the caller's conversations
//! - `GET /api/apps/{app}/conversations/{id}` - Get a conversation
//! - `DELETE /api/apps/{app}/conversations/{id}` - Delete a conversation
//!
//! The caller is identified by `userId` (body or query), then the `x-user-id` header.

mod conversations;
mod routes;
mod run;
pub mod types;

pub use routes::{resolve_user, router, serve, AppState, USER_HEADER};
pub use types::*;
