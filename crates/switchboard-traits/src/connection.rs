//! Connection seam: the per-account source of new channels.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::channel::{Channel, ChannelKind, TargetHandle};
use crate::error::ChannelError;

/// Stable identity of a middleware connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Stream of channels announced by a connection, in arrival order.
pub type ChannelStream = Pin<Box<dyn Stream<Item = Arc<dyn Channel>> + Send>>;

/// Middleware connection consumed by the dispatcher.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// Wait until the connection is connected and can list its channels.
    async fn become_ready(&self) -> Result<(), ChannelError>;

    /// Live "new channel" notifications.
    ///
    /// Only channels announced after this call are yielded; callers that also
    /// want the backlog subscribe first and then call [`Connection::list_channels`].
    fn new_channels(&self) -> ChannelStream;

    /// Channels that already exist on the connection.
    async fn list_channels(&self) -> Result<Vec<Arc<dyn Channel>>, ChannelError>;

    /// Invalidation notification. Holds `Some(error)` once the connection is gone.
    fn subscribe_invalidated(&self) -> watch::Receiver<Option<ChannelError>>;

    /// Ask the middleware for a channel of `kind` to `target`.
    ///
    /// The returned channel is also announced through [`Connection::new_channels`].
    async fn request_channel(
        &self,
        kind: ChannelKind,
        target: TargetHandle,
    ) -> Result<Arc<dyn Channel>, ChannelError>;
}
