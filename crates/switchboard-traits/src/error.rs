//! Middleware error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by the middleware when a channel or connection fails.
///
/// Carries the (domain, code, message) triple the middleware attaches to
/// invalidation notifications and failed readiness waits.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{domain} ({code}): {message}")]
pub struct ChannelError {
    pub domain: String,
    pub code: i32,
    pub message: String,
}

impl ChannelError {
    pub fn new(domain: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    /// Error used when a channel is closed locally.
    pub fn closed() -> Self {
        Self::new("channel", 0, "Channel closed")
    }

    /// Error used when a connection goes away underneath its channels.
    pub fn disconnected() -> Self {
        Self::new("connection", 0, "Disconnected")
    }
}
