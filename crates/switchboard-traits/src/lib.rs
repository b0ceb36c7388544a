//! Seams between the Switchboard dispatch engine and the messaging middleware.
//!
//! The engine consumes these traits; the middleware (or the loopback
//! implementation in `switchboard-core`) provides them.

pub mod channel;
pub mod connection;
pub mod contact;
pub mod error;
pub mod tube;
pub mod wrapper;

pub use channel::{
    Channel, ChannelKind, HandleType, TargetHandle, TubeEvent, TubeInfo, TubeState, TubeType,
    wait_invalidated,
};
pub use connection::{ChannelStream, Connection, ConnectionId};
pub use contact::{Contact, ContactResolver};
pub use error::ChannelError;
pub use tube::{TubeDescriptor, TubeHandlerDirectory};
pub use wrapper::{
    CallChannel, ChannelWrapper, ChatChannel, FileOffer, FileTransferChannel, ReceivedMessage,
    WrapperFactory,
};
