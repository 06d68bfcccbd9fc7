use std::env;

use crate::buffer::DEFAULT_EXPANDING_INITIAL;
use crate::error::ConfigError;

/// Interpreter settings, loaded from `SAGAFLOW_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaConfig {
    /// Log failures of root and spawned tasks at `error` level.
    pub log_uncaught: bool,
    /// Initial capacity of channels built by `SagaMiddleware::channel`.
    pub expanding_buffer_initial: usize,
    /// Warn when this many puts/dispatches are queued at once.
    pub queue_warn_threshold: usize,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            log_uncaught: true,
            expanding_buffer_initial: DEFAULT_EXPANDING_INITIAL,
            queue_warn_threshold: 1_000,
        }
    }
}

impl SagaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            log_uncaught: parse_bool(&lookup, "SAGAFLOW_LOG_UNCAUGHT", defaults.log_uncaught)?,
            expanding_buffer_initial: parse_usize(
                &lookup,
                "SAGAFLOW_EXPANDING_BUFFER_INITIAL",
                defaults.expanding_buffer_initial,
            )?,
            queue_warn_threshold: parse_usize(
                &lookup,
                "SAGAFLOW_QUEUE_WARN_THRESHOLD",
                defaults.queue_warn_threshold,
            )?,
        })
    }

    pub fn log_summary(&self) {
        tracing::info!("Saga config loaded:");
        tracing::info!("  SAGAFLOW_LOG_UNCAUGHT: {}", self.log_uncaught);
        tracing::info!(
            "  SAGAFLOW_EXPANDING_BUFFER_INITIAL: {}",
            self.expanding_buffer_initial
        );
        tracing::info!("  SAGAFLOW_QUEUE_WARN_THRESHOLD: {}", self.queue_warn_threshold);
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                expected: "a boolean",
                value: raw,
            }),
        },
    }
}

fn parse_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            expected: "a non-negative integer",
            value: raw,
        }),
    }
}
