use std::sync::Arc;

use switchboard_traits::{ChannelError, ConnectionId, TubeDescriptor};

use super::operation::DispatchOperation;

/// Registry-level event.
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    /// Operation reached PENDING.
    Observe(Arc<DispatchOperation>),
    /// Incoming operation waits for approval.
    FilterChannel(Arc<DispatchOperation>),
    /// Operation is dispatching and waits for a handler to claim it.
    DispatchChannel(Arc<DispatchOperation>),
    /// Local-pending sub-tube without a running handler.
    FilterTube(TubeDescriptor),
    ConnectionLost {
        connection: ConnectionId,
        error: ChannelError,
    },
}

impl DispatcherEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Observe(_) => "observe",
            Self::FilterChannel(_) => "filter-channel",
            Self::DispatchChannel(_) => "dispatch-channel",
            Self::FilterTube(_) => "filter-tube",
            Self::ConnectionLost { .. } => "connection-lost",
        }
    }

    pub fn operation(&self) -> Option<&Arc<DispatchOperation>> {
        match self {
            Self::Observe(op) | Self::FilterChannel(op) | Self::DispatchChannel(op) => Some(op),
            Self::FilterTube(_) | Self::ConnectionLost { .. } => None,
        }
    }
}
