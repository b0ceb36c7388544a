//! Typed Channel Wrappers
//!
//! The façades the rest of the application understands. A wrapper is built by
//! a [`WrapperFactory`] once the underlying [`Channel`] is ready, and may need
//! its own readiness step before the dispatcher can announce it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::channel::{Channel, ChannelKind};
use crate::contact::Contact;
use crate::error::ChannelError;

/// A message received on a text channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_handle: Option<u32>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl ReceivedMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            sender_handle: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_sender(mut self, handle: u32) -> Self {
        self.sender_handle = Some(handle);
        self
    }
}

/// Chat façade over a text channel.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    fn channel(&self) -> Arc<dyn Channel>;

    /// Conversation identifier, known once the chat is ready.
    fn conversation_id(&self) -> Option<String>;

    fn is_ready(&self) -> bool {
        self.conversation_id().is_some()
    }

    /// Wait until the conversation identifier is resolved.
    async fn wait_ready(&self) -> Result<(), ChannelError>;

    fn subscribe_messages(&self) -> broadcast::Receiver<ReceivedMessage>;

    /// Messages received so far that nobody has acknowledged yet.
    fn pending_messages(&self) -> Vec<ReceivedMessage>;
}

/// Call façade over a streamed-media channel.
#[async_trait]
pub trait CallChannel: Send + Sync {
    fn channel(&self) -> Arc<dyn Channel>;

    fn remote_contact(&self) -> Option<Contact>;

    /// Wait until the remote contact is known.
    async fn wait_contact(&self) -> Result<Contact, ChannelError>;
}

/// Details of an offered file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub filename: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// File transfer façade. Accepting or rejecting is up to the UI.
pub trait FileTransferChannel: Send + Sync {
    fn channel(&self) -> Arc<dyn Channel>;

    fn offer(&self) -> FileOffer;
}

/// Channel-type-specific façade, one variant per dispatchable kind.
///
/// Tubes have no wrapper: they are handled sub-tube by sub-tube.
#[derive(Clone)]
pub enum ChannelWrapper {
    Chat(Arc<dyn ChatChannel>),
    Call(Arc<dyn CallChannel>),
    FileTransfer(Arc<dyn FileTransferChannel>),
}

impl ChannelWrapper {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Chat(_) => ChannelKind::Text,
            Self::Call(_) => ChannelKind::StreamedMedia,
            Self::FileTransfer(_) => ChannelKind::FileTransfer,
        }
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        match self {
            Self::Chat(chat) => chat.channel(),
            Self::Call(call) => call.channel(),
            Self::FileTransfer(transfer) => transfer.channel(),
        }
    }

    pub fn as_chat(&self) -> Option<&Arc<dyn ChatChannel>> {
        match self {
            Self::Chat(chat) => Some(chat),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&Arc<dyn CallChannel>> {
        match self {
            Self::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_file_transfer(&self) -> Option<&Arc<dyn FileTransferChannel>> {
        match self {
            Self::FileTransfer(transfer) => Some(transfer),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ChannelWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWrapper")
            .field("kind", &self.kind())
            .field("object_path", &self.channel().object_path())
            .finish()
    }
}

/// Builds typed wrappers around ready channels.
pub trait WrapperFactory: Send + Sync {
    fn chat(&self, channel: Arc<dyn Channel>) -> Arc<dyn ChatChannel>;

    fn call(&self, channel: Arc<dyn Channel>) -> Arc<dyn CallChannel>;

    fn file_transfer(&self, channel: Arc<dyn Channel>) -> Arc<dyn FileTransferChannel>;
}
