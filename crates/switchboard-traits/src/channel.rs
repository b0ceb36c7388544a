//! Channel Trait Definitions
//!
//! A channel is an opaque, middleware-owned endpoint. The dispatch engine only
//! borrows it: it reads its identity and type, waits for it to become ready,
//! watches for invalidation and closes it when nobody needs it anymore.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::ChannelError;

/// Channel type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    StreamedMedia,
    FileTransfer,
    Tube,
}

impl ChannelKind {
    /// Display name for UI
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::StreamedMedia => "Call",
            Self::FileTransfer => "File transfer",
            Self::Tube => "Tube",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// What a channel's target handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleType {
    #[default]
    None,
    Contact,
    Room,
}

/// Target of a channel (the remote contact or room it talks to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TargetHandle {
    pub handle_type: HandleType,
    pub handle: u32,
}

impl TargetHandle {
    pub fn contact(handle: u32) -> Self {
        Self {
            handle_type: HandleType::Contact,
            handle,
        }
    }

    pub fn room(handle: u32) -> Self {
        Self {
            handle_type: HandleType::Room,
            handle,
        }
    }

    pub fn is_contact(&self) -> bool {
        self.handle_type == HandleType::Contact
    }
}

/// Application protocol family carried by a sub-tube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TubeType {
    DBus,
    Stream,
}

/// Sub-state of a single sub-tube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TubeState {
    /// Offered by the remote side, waiting for a local handler.
    LocalPending,
    /// Offered by us, waiting for the remote side.
    RemotePending,
    Open,
}

/// A sub-tube inside a tube channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeInfo {
    pub id: u32,
    /// Handle of the contact who offered the tube
    pub initiator: u32,
    pub tube_type: TubeType,
    pub service: String,
    pub state: TubeState,
}

/// Sub-tube lifecycle notification from a tube channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TubeEvent {
    New(TubeInfo),
    Closed { id: u32 },
}

/// Middleware channel consumed by the dispatch engine.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique identity of the channel on its connection.
    fn object_path(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    fn target(&self) -> TargetHandle;

    /// Whether the local side requested this channel (outgoing).
    fn requested(&self) -> bool;

    fn is_incoming(&self) -> bool {
        !self.requested()
    }

    /// Wait until the channel can be introspected.
    async fn become_ready(&self) -> Result<(), ChannelError>;

    /// Invalidation notification. Holds `Some(error)` once the channel is gone.
    fn subscribe_invalidated(&self) -> watch::Receiver<Option<ChannelError>>;

    /// Close the channel.
    async fn close(&self) -> Result<(), ChannelError>;

    /// Sub-tube notifications (tube channels only).
    fn subscribe_tube_events(&self) -> Option<broadcast::Receiver<TubeEvent>> {
        None
    }

    /// Sub-tubes that already exist (tube channels only).
    async fn list_tubes(&self) -> Result<Vec<TubeInfo>, ChannelError> {
        Ok(Vec::new())
    }

    /// Close one sub-tube (tube channels only).
    async fn close_tube(&self, tube_id: u32) -> Result<(), ChannelError> {
        let _ = tube_id;
        Ok(())
    }
}

/// Wait for an invalidation notification.
///
/// Returns `None` when the notifier went away without ever invalidating.
pub async fn wait_invalidated(
    receiver: &mut watch::Receiver<Option<ChannelError>>,
) -> Option<ChannelError> {
    match receiver.wait_for(|error| error.is_some()).await {
        Ok(error) => (*error).clone(),
        Err(_) => None,
    }
}
