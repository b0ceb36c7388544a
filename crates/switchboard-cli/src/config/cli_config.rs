//! CLI configuration file support
//!
//! Loads configuration from ~/.config/switchboard/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use switchboard_core::DispatcherConfig;

/// CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Dispatcher settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Simulator settings
    #[serde(default)]
    pub simulate: SimulateConfig,
}

/// How `switchboard simulate` plays the handler side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Approve every filtered channel and process every filtered tube
    pub auto_approve: bool,
    /// Claim every dispatched channel
    pub auto_claim: bool,
    /// Stop after this long without dispatcher events
    pub idle_timeout_ms: u64,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            auto_approve: true,
            auto_claim: true,
            idle_timeout_ms: 200,
        }
    }
}

impl CliConfig {
    /// Load configuration from default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|error| {
                tracing::warn!("Ignoring invalid config {}: {}", path.display(), error);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("switchboard").join("config.toml"))
    }
}
