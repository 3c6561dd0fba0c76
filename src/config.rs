//! Configuration management for the AG-UI bridge.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `CONVERSATION_STORE` - Optional. `memory`, `file` or `sqlite`. Defaults to `memory`.
//! - `CONVERSATION_STORE_DIR` - Optional. Directory for the file and sqlite stores. Defaults to `./data`.
//! - `SESSION_LOCK_TIMEOUT_MS` - Optional. How long a run waits for a busy conversation. Defaults to `0` (reject immediately).
//! - `ENGINE_EVENT_TIMEOUT_MS` - Optional. Bound on the wait for each engine event. Unset means no bound.
//! - `ENGINE_EVENT_TIMEOUT_ABORT` - Optional. Fail the run on an event timeout instead of emitting an idle event. Defaults to `false`.
//! - `TRANSLATION_ERROR_POLICY` - Optional. `abort` or `skip`. Defaults to `abort`.
//! - `EMIT_THOUGHTS` - Optional. Forward agent reasoning as `THINKING` events. Defaults to `false`.
//! - `SSE_KEEPALIVE_SECS` - Optional. Keepalive comment interval on event streams. Defaults to `15`.
//! - `DEFAULT_APP` - Optional. Application served by `POST /api/run`, and the name the echo engine is registered under. Defaults to `echo`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::{EventTimeoutPolicy, RunConfig, TimeoutAction, TranslationErrorPolicy};
use crate::store::StoreType;
use crate::util::{env_var_bool, env_var_millis};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Conversation store backend
    pub store_type: StoreType,

    /// Directory for persistent stores
    pub store_dir: PathBuf,

    /// Wait for a busy session before reporting `SESSION_BUSY`
    pub lock_timeout: Duration,

    /// Per-event wait bound for engine streams
    pub event_timeout: Option<EventTimeoutPolicy>,

    pub translation_errors: TranslationErrorPolicy,

    pub emit_thoughts: bool,

    pub sse_keepalive: Duration,

    pub default_app: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            store_type: StoreType::Memory,
            store_dir: PathBuf::from("./data"),
            lock_timeout: Duration::ZERO,
            event_timeout: None,
            translation_errors: TranslationErrorPolicy::Abort,
            emit_thoughts: false,
            sse_keepalive: Duration::from_secs(15),
            default_app: "echo".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = std::env::var("HOST").unwrap_or(defaults.host);

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let store_type = match std::env::var("CONVERSATION_STORE") {
            Ok(value) => StoreType::from_str(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "CONVERSATION_STORE".to_string(),
                    format!("unknown store '{}' (expected memory, file or sqlite)", value),
                )
            })?,
            Err(_) => defaults.store_type,
        };

        let store_dir = std::env::var("CONVERSATION_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.store_dir);

        let lock_timeout = env_var_millis("SESSION_LOCK_TIMEOUT_MS")?.unwrap_or(Duration::ZERO);

        let event_timeout =
            env_var_millis("ENGINE_EVENT_TIMEOUT_MS")?
                .filter(|d| !d.is_zero())
                .map(|timeout| EventTimeoutPolicy {
                    timeout,
                    on_timeout: if env_var_bool("ENGINE_EVENT_TIMEOUT_ABORT", false) {
                        TimeoutAction::Abort
                    } else {
                        TimeoutAction::Continue
                    },
                });

        let translation_errors = match std::env::var("TRANSLATION_ERROR_POLICY") {
            Ok(value) => TranslationErrorPolicy::from_str(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "TRANSLATION_ERROR_POLICY".to_string(),
                    format!("unknown policy '{}' (expected abort or skip)", value),
                )
            })?,
            Err(_) => defaults.translation_errors,
        };

        let emit_thoughts = env_var_bool("EMIT_THOUGHTS", false);

        let sse_keepalive = match std::env::var("SSE_KEEPALIVE_SECS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    ConfigError::InvalidValue(
                        "SSE_KEEPALIVE_SECS".to_string(),
                        format!("expected a positive number of seconds, got '{}'", value),
                    )
                })?,
            Err(_) => defaults.sse_keepalive,
        };

        let default_app = std::env::var("DEFAULT_APP")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.default_app);

        Ok(Self {
            host,
            port,
            store_type,
            store_dir,
            lock_timeout,
            event_timeout,
            translation_errors,
            emit_thoughts,
            sse_keepalive,
            default_app,
        })
    }

    /// Per-run settings handed to every orchestrator.
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            lock_timeout: self.lock_timeout,
            event_timeout: self.event_timeout,
            translation_errors: self.translation_errors,
            emit_thoughts: self.emit_thoughts,
        }
    }
}
