//! Shared utility functions used across the codebase.

use std::time::Duration;

use crate::config::ConfigError;

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

/// Parse an environment variable holding milliseconds. `Ok(None)` when unset or blank.
pub fn env_var_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => parse_millis(&value)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e)),
        Err(_) => Ok(None),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn parse_millis(value: &str) -> Result<Option<Duration>, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|e| format!("expected milliseconds, got '{}': {}", trimmed, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_values() {
        for value in ["1", "true", "YES", " on ", "y"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "nope", ""] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn parse_millis_handles_blank_and_garbage() {
        assert_eq!(parse_millis(""), Ok(None));
        assert_eq!(parse_millis("250"), Ok(Some(Duration::from_millis(250))));
        assert!(parse_millis("soon").is_err());
    }
}
