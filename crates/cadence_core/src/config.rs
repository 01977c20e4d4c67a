//! Configuration for the sync and notification core
//!
//! Tunables are plain serde values so hosts can load them from a TOML file
//! or construct them directly. Defaults match shipped behavior.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::util::duration_millis;

/// Core tunables shared by the stores, engines, and reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Quiet interval for collapsing local edits into one remote push.
    #[serde(with = "duration_millis")]
    pub debounce_window: Duration,

    /// Delay after a namespace switch before reconciling notifications, so
    /// sibling stores finish switching first.
    #[serde(with = "duration_millis")]
    pub settle_delay: Duration,

    /// Namespace used for guest sessions. Guest data never syncs remotely
    /// but is still partitioned under this key.
    pub guest_namespace: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(500),
            settle_delay: Duration::from_millis(500),
            guest_namespace: "guest".to_string(),
        }
    }
}

impl CoreConfig {
    /// Parse a config from TOML text. Missing fields take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CoreError::ConfigurationError {
            config_path: "<inline>".to_string(),
            field: "core".to_string(),
            cause: Box::new(e),
        })
    }

    /// Load a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "core".to_string(),
            cause: Box::new(e),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "core".to_string(),
            cause: Box::new(e),
        })?;
        Ok(config)
    }
}
