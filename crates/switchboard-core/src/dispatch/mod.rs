//! Channel dispatch: operations, the connection registry and tube handling.

mod connection_state;
mod dispatcher;
mod events;
mod operation;
mod state;
mod tubes;
mod wrapper;

pub use dispatcher::{Dispatcher, DispatcherDeps};
pub use events::DispatcherEvent;
pub use operation::{ClaimedChannel, DispatchOperation, DispatchOperationBuilder};
pub use state::{OperationEvent, OperationState};
pub use tubes::{TubeRecord, handler_bus_name, handler_object_path};
pub use wrapper::{build_wrapper, wait_wrapper_ready};
