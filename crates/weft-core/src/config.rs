#![forbid(unsafe_code)]

//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is resolved once when a runtime is created. Every
//! option can come from code (builder methods), from JSON, or from the
//! process environment:
//!
//! | Variable          | Values              | Field            |
//! |-------------------|---------------------|------------------|
//! | `WEFT_PROP_COPY`  | `shallow` / `deep`  | `prop_copy`      |
//! | `WEFT_SYNC_FLUSH` | `0` / `1`           | `sync_flush`     |
//! | `WEFT_MAX_ROUNDS` | positive integer    | `max_flush_rounds` |

use std::env;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::copy::CopyMode;
use crate::error::{ReactiveError, Result};

/// Default bound on change-propagation rounds per flush.
pub const DEFAULT_MAX_FLUSH_ROUNDS: u32 = 100;

/// Options for a reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Copy strategy for one-way props, fixed at prop construction.
    pub prop_copy: CopyMode,
    /// Deliver change notifications as soon as they happen (outside of batch
    /// scopes). When false, changes queue until `Runtime::flush`.
    pub sync_flush: bool,
    /// Upper bound on propagation rounds before a flush gives up.
    pub max_flush_rounds: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prop_copy: CopyMode::Deep,
            sync_flush: true,
            max_flush_rounds: DEFAULT_MAX_FLUSH_ROUNDS,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_prop_copy(mut self, mode: CopyMode) -> Self {
        self.prop_copy = mode;
        self
    }

    #[must_use]
    pub fn with_sync_flush(mut self, sync: bool) -> Self {
        self.sync_flush = sync;
        self
    }

    #[must_use]
    pub fn with_max_flush_rounds(mut self, rounds: u32) -> Self {
        self.max_flush_rounds = rounds.max(1);
        self
    }

    /// Read overrides from the process environment on top of the defaults.
    ///
    /// # Errors
    ///
    /// [`ReactiveError::Config`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        let copy = env::var("WEFT_PROP_COPY").ok();
        let sync = env::var("WEFT_SYNC_FLUSH").ok();
        let rounds = env::var("WEFT_MAX_ROUNDS").ok();
        Self::from_env_values(copy.as_deref(), sync.as_deref(), rounds.as_deref())
    }

    /// Build a config from raw environment values. Separated from
    /// [`from_env`](Self::from_env) so it can be tested without touching the
    /// process environment.
    pub fn from_env_values(
        copy: Option<&str>,
        sync: Option<&str>,
        rounds: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::default();
        if let Some(copy) = copy.filter(|s| !s.trim().is_empty()) {
            config.prop_copy = copy.parse()?;
        }
        if let Some(sync) = sync.filter(|s| !s.trim().is_empty()) {
            config.sync_flush = parse_flag(sync)?;
        }
        if let Some(rounds) = rounds.filter(|s| !s.trim().is_empty()) {
            let parsed: u32 = rounds.trim().parse().map_err(|_| {
                ReactiveError::Config(format!("WEFT_MAX_ROUNDS must be a positive integer, got '{rounds}'"))
            })?;
            if parsed == 0 {
                return Err(ReactiveError::Config("WEFT_MAX_ROUNDS must be at least 1".into()));
            }
            config.max_flush_rounds = parsed;
        }
        if config != Self::default() {
            debug!(
                prop_copy = %config.prop_copy,
                sync_flush = config.sync_flush,
                max_flush_rounds = config.max_flush_rounds,
                "runtime config overridden from environment"
            );
        }
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ReactiveError::Config(e.to_string()))?;
        if config.max_flush_rounds == 0 {
            return Err(ReactiveError::Config("max_flush_rounds must be at least 1".into()));
        }
        Ok(config)
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ReactiveError::Config(format!("expected a boolean flag, got '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.prop_copy, CopyMode::Deep);
        assert!(config.sync_flush);
        assert_eq!(config.max_flush_rounds, DEFAULT_MAX_FLUSH_ROUNDS);
    }

    #[test]
    fn builder_clamps_rounds() {
        let config = RuntimeConfig::new()
            .with_prop_copy(CopyMode::Shallow)
            .with_sync_flush(false)
            .with_max_flush_rounds(0);
        assert_eq!(config.prop_copy, CopyMode::Shallow);
        assert!(!config.sync_flush);
        assert_eq!(config.max_flush_rounds, 1);
    }

    #[test]
    fn env_values_override_defaults() {
        let config = RuntimeConfig::from_env_values(Some("shallow"), Some("0"), Some("7")).unwrap();
        assert_eq!(config.prop_copy, CopyMode::Shallow);
        assert!(!config.sync_flush);
        assert_eq!(config.max_flush_rounds, 7);

        let config = RuntimeConfig::from_env_values(None, Some(""), None).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn env_values_reject_garbage() {
        assert!(RuntimeConfig::from_env_values(Some("wide"), None, None).is_err());
        assert!(RuntimeConfig::from_env_values(None, Some("maybe"), None).is_err());
        assert!(RuntimeConfig::from_env_values(None, None, Some("0")).is_err());
        assert!(RuntimeConfig::from_env_values(None, None, Some("-3")).is_err());
    }

    #[test]
    fn json_partial_document() {
        let config = RuntimeConfig::from_json(r#"{"prop_copy":"shallow"}"#).unwrap();
        assert_eq!(config.prop_copy, CopyMode::Shallow);
        assert!(config.sync_flush);

        assert!(RuntimeConfig::from_json(r#"{"prop_copy":"wide"}"#).is_err());
        assert!(RuntimeConfig::from_json(r#"{"max_flush_rounds":0}"#).is_err());
    }
}
