//! Dispatcher configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How outgoing text channels are announced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingTextPolicy {
    /// Announce as soon as the operation reaches DISPATCHING.
    #[default]
    Immediate,
    /// Hold `DispatchChannel` back until the first message is received on the chat.
    AwaitFirstMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub outgoing_text: OutgoingTextPolicy,
    /// Buffer size of the dispatcher and per-operation event buses
    pub event_capacity: usize,
    /// Namespace prepended to tube handler bus names
    pub tube_handler_namespace: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            outgoing_text: OutgoingTextPolicy::Immediate,
            event_capacity: 64,
            tube_handler_namespace: "org.switchboard".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn with_outgoing_text(mut self, policy: OutgoingTextPolicy) -> Self {
        self.outgoing_text = policy;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_tube_handler_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.tube_handler_namespace = namespace.into();
        self
    }

    /// Event bus capacity, never zero.
    pub(crate) fn capacity(&self) -> usize {
        self.event_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.outgoing_text, OutgoingTextPolicy::Immediate);
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.tube_handler_namespace, "org.switchboard");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DispatcherConfig::from_toml_str("outgoing_text = \"await_first_message\"\n")
            .unwrap();
        assert_eq!(config.outgoing_text, OutgoingTextPolicy::AwaitFirstMessage);
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = DispatcherConfig::from_toml_str("").unwrap();
        assert_eq!(config, DispatcherConfig::default());
    }

    #[test]
    fn test_invalid_policy_is_config_error() {
        let err = DispatcherConfig::from_toml_str("outgoing_text = \"later\"").unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::Config(_)));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let config = DispatcherConfig::default().with_event_capacity(0);
        assert_eq!(config.capacity(), 1);
    }
}
