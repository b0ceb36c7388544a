//! Tube handler seam.

use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{Channel, TubeType};
use crate::connection::ConnectionId;
use crate::contact::Contact;
use crate::error::ChannelError;

/// A local-pending sub-tube waiting for a handler.
#[derive(Clone)]
pub struct TubeDescriptor {
    pub connection: ConnectionId,
    pub channel: Arc<dyn Channel>,
    pub tube_id: u32,
    pub initiator_handle: u32,
    pub initiator: Option<Contact>,
    pub service: String,
    pub tube_type: TubeType,
    /// Well-known name of the process handling this tube type and service
    pub bus_name: String,
    pub object_path: String,
    /// Whether a handler can be started for this tube
    pub activatable: bool,
}

impl TubeDescriptor {
    pub fn channel_path(&self) -> &str {
        self.channel.object_path()
    }
}

impl std::fmt::Debug for TubeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TubeDescriptor")
            .field("connection", &self.connection)
            .field("channel", &self.channel.object_path())
            .field("tube_id", &self.tube_id)
            .field("initiator_handle", &self.initiator_handle)
            .field("initiator", &self.initiator)
            .field("service", &self.service)
            .field("tube_type", &self.tube_type)
            .field("bus_name", &self.bus_name)
            .field("object_path", &self.object_path)
            .field("activatable", &self.activatable)
            .finish()
    }
}

/// Directory of external tube handler processes.
#[async_trait]
pub trait TubeHandlerDirectory: Send + Sync {
    /// Whether a handler currently owns `bus_name`.
    async fn is_running(&self, bus_name: &str) -> bool;

    /// Names that can be started on demand.
    async fn activatable_names(&self) -> Result<Vec<String>, ChannelError>;

    /// Hand the tube to its handler.
    async fn handle_tube(&self, tube: &TubeDescriptor) -> Result<(), ChannelError>;
}
