//! Engine configuration.

use std::env;

/// Runtime configuration shared by every collection of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Verify every crdt write by rebuilding it from its own log
    pub dev_mode: bool,
    /// How many times a write is recomputed after a revision conflict
    pub max_write_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dev_mode: cfg!(debug_assertions),
            max_write_retries: 16,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// - `SPLICE_DEV_MODE`: `true`/`false` (also `1`/`0`, `yes`/`no`)
    /// - `SPLICE_MAX_WRITE_RETRIES`: non-negative integer
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let dev_mode = match lookup("SPLICE_DEV_MODE") {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => return Err(ConfigError::InvalidDevMode(raw)),
            },
            None => defaults.dev_mode,
        };

        let max_write_retries = match lookup("SPLICE_MAX_WRITE_RETRIES") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidMaxWriteRetries(raw))?,
            None => defaults.max_write_retries,
        };

        Ok(Self {
            dev_mode,
            max_write_retries,
        })
    }

    /// Builder-style method to toggle the write self-check.
    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    /// Builder-style method to set the retry bound.
    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid SPLICE_DEV_MODE value: {0}")]
    InvalidDevMode(String),

    #[error("Invalid SPLICE_MAX_WRITE_RETRIES value: {0}")]
    InvalidMaxWriteRetries(String),
}
