//! Session configuration
//!
//! Transaction options and health probe settings for a root session, loadable
//! from the environment:
//!
//! | variable | meaning | default |
//! |----------|---------|---------|
//! | `TXCTX_ISOLATION_LEVEL` | `read_uncommitted`, `read_committed`, `repeatable_read` or `serializable` | server default |
//! | `TXCTX_READ_ONLY` | `true` or `false` | `false` |
//! | `TXCTX_HEALTH_CHECK_TIMEOUT_MS` | ping timeout in milliseconds | `5000` |

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transaction::{IsolationLevel, TxOptions};

pub const ISOLATION_LEVEL_VAR: &str = "TXCTX_ISOLATION_LEVEL";
pub const READ_ONLY_VAR: &str = "TXCTX_READ_ONLY";
pub const HEALTH_CHECK_TIMEOUT_VAR: &str = "TXCTX_HEALTH_CHECK_TIMEOUT_MS";

/// Default bound on the liveness ping
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;

/// Configuration errors
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn validation_failed(message: impl Into<String>) -> Self {
        ConfigError::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Root session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Isolation level for every transaction; `None` keeps the server default
    pub isolation_level: Option<IsolationLevel>,
    /// Begin every transaction read-only
    pub read_only: bool,
    /// Ping timeout used by the health probe, in milliseconds
    pub health_check_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            isolation_level: None,
            read_only: false,
            health_check_timeout_ms: DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Load configuration from `TXCTX_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let isolation_level = match lookup(ISOLATION_LEVEL_VAR) {
            Some(value) if !value.trim().is_empty() => {
                Some(value.parse::<IsolationLevel>().map_err(|_| ConfigError::InvalidValue {
                    field: "isolation_level".to_string(),
                    value: value.clone(),
                    expected: "read_uncommitted, read_committed, repeatable_read or serializable".to_string(),
                })?)
            }
            _ => None,
        };

        let read_only = match lookup(READ_ONLY_VAR) {
            Some(value) => value.trim().parse::<bool>().map_err(|_| ConfigError::InvalidValue {
                field: "read_only".to_string(),
                value: value.clone(),
                expected: "true or false".to_string(),
            })?,
            None => false,
        };

        let health_check_timeout_ms = match lookup(HEALTH_CHECK_TIMEOUT_VAR) {
            Some(value) => value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                field: "health_check_timeout_ms".to_string(),
                value: value.clone(),
                expected: "valid number of milliseconds".to_string(),
            })?,
            None => DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
        };

        let config = SessionConfig {
            isolation_level,
            read_only,
            health_check_timeout_ms,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_timeout_ms == 0 {
            return Err(ConfigError::validation_failed(
                "Health check timeout must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Get health check timeout as Duration
    pub fn health_check_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Transaction options, or `None` when nothing differs from the server defaults
    pub fn tx_options(&self) -> Option<TxOptions> {
        if self.isolation_level.is_none() && !self.read_only {
            return None;
        }
        Some(TxOptions {
            isolation_level: self.isolation_level,
            read_only: self.read_only,
        })
    }
}
