use switchboard_traits::{ChannelError, ConnectionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Channel request cancelled")]
    RequestCancelled,

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
