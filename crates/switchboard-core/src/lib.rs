//! Switchboard dispatch engine.
//!
//! Routes every channel a messaging connection creates to exactly one handler.
//! See [`Dispatcher`] for the registry and [`DispatchOperation`] for the
//! per-channel state machine.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod loopback;

pub use config::{DispatcherConfig, OutgoingTextPolicy};
pub use dispatch::{
    ClaimedChannel, DispatchOperation, DispatchOperationBuilder, Dispatcher, DispatcherDeps,
    DispatcherEvent, OperationEvent, OperationState,
};
pub use error::{DispatchError, Result};

pub use switchboard_traits as traits;
