//! Per-connection bookkeeping of the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use switchboard_traits::{ChannelKind, ChannelWrapper, Connection};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::operation::DispatchOperation;
use super::tubes::TubeRecord;
use crate::error::Result;

/// A channel a handler has claimed.
pub(crate) struct DispatchedChannel {
    /// Wrapper the channel was presented with, reused on re-request
    pub wrapper: Option<ChannelWrapper>,
}

/// A local channel request waiting for its operation to become ready.
pub(crate) struct PendingRequest {
    pub id: Uuid,
    pub kind: ChannelKind,
    /// Bound once the middleware answered the request
    pub operation: Option<Arc<DispatchOperation>>,
    pub reply: oneshot::Sender<Result<Arc<DispatchOperation>>>,
}

pub(crate) struct ConnectionState {
    pub connection: Arc<dyn Connection>,
    pub dispatched: HashMap<String, DispatchedChannel>,
    pub dispatching: HashMap<String, Arc<DispatchOperation>>,
    /// Incoming operations held back while a request of their kind is in flight
    pub outstanding: Vec<Arc<DispatchOperation>>,
    pub requests: Vec<PendingRequest>,
    pub tubes: HashMap<String, TubeRecord>,
    pub backlog_drained: bool,
}

impl ConnectionState {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            dispatched: HashMap::new(),
            dispatching: HashMap::new(),
            outstanding: Vec::new(),
            requests: Vec::new(),
            tubes: HashMap::new(),
            backlog_drained: false,
        }
    }

    /// Whether the channel is already dispatched, dispatching or outstanding.
    pub fn knows(&self, object_path: &str) -> bool {
        self.dispatched.contains_key(object_path)
            || self.dispatching.contains_key(object_path)
            || self.outstanding_position(object_path).is_some()
            || self.tubes.contains_key(object_path)
    }

    /// An operation can start unless a request of its kind is still unanswered.
    pub fn can_start(&self, kind: ChannelKind) -> bool {
        !self
            .requests
            .iter()
            .any(|request| request.operation.is_none() && request.kind == kind)
    }

    pub fn outstanding_position(&self, object_path: &str) -> Option<usize> {
        self.outstanding
            .iter()
            .position(|operation| operation.object_path() == object_path)
    }

    pub fn take_outstanding(&mut self, object_path: &str) -> Option<Arc<DispatchOperation>> {
        let index = self.outstanding_position(object_path)?;
        Some(self.outstanding.remove(index))
    }

    /// Remove the outstanding operations that may start now, in arrival order.
    pub fn take_startable(&mut self) -> Vec<Arc<DispatchOperation>> {
        let (startable, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.outstanding)
            .into_iter()
            .partition(|operation| self.can_start(operation.kind()));
        self.outstanding = held;
        startable
    }

    /// Drop every trace of a channel. Returns `true` if anything was removed.
    pub fn forget(&mut self, object_path: &str) -> bool {
        let dispatched = self.dispatched.remove(object_path).is_some();
        let dispatching = self.dispatching.remove(object_path).is_some();
        let outstanding = self.take_outstanding(object_path).is_some();
        let tube = self.tubes.remove(object_path).is_some();
        dispatched || dispatching || outstanding || tube
    }

    /// Remove the requests bound to the operation at `object_path`.
    pub fn take_requests_for(&mut self, object_path: &str) -> Vec<PendingRequest> {
        let (bound, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.requests)
                .into_iter()
                .partition(|request| {
                    request
                        .operation
                        .as_ref()
                        .is_some_and(|operation| operation.object_path() == object_path)
                });
        self.requests = rest;
        bound
    }

    pub fn take_request(&mut self, id: Uuid) -> Option<PendingRequest> {
        let index = self.requests.iter().position(|request| request.id == id)?;
        Some(self.requests.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackChannel, LoopbackConnection, LoopbackWrapperFactory};
    use switchboard_traits::{Channel, ConnectionId, TargetHandle};

    fn operation(path: &str, kind: ChannelKind) -> Arc<DispatchOperation> {
        let channel: Arc<dyn Channel> =
            LoopbackChannel::incoming(path, kind, TargetHandle::contact(1));
        DispatchOperation::builder(ConnectionId::new("test"), channel)
            .spawn(Arc::new(LoopbackWrapperFactory::new()))
    }

    fn request(kind: ChannelKind) -> (PendingRequest, oneshot::Receiver<Result<Arc<DispatchOperation>>>) {
        let (reply, rx) = oneshot::channel();
        (
            PendingRequest {
                id: Uuid::new_v4(),
                kind,
                operation: None,
                reply,
            },
            rx,
        )
    }

    fn state() -> ConnectionState {
        ConnectionState::new(LoopbackConnection::new("test"))
    }

    #[tokio::test]
    async fn test_unanswered_request_blocks_same_kind() {
        let mut state = state();
        let (pending, _rx) = request(ChannelKind::Text);
        state.requests.push(pending);

        assert!(!state.can_start(ChannelKind::Text));
        assert!(state.can_start(ChannelKind::StreamedMedia));

        state.outstanding.push(operation("/text/1", ChannelKind::Text));
        state.outstanding.push(operation("/call/1", ChannelKind::StreamedMedia));
        let startable = state.take_startable();
        assert_eq!(startable.len(), 1);
        assert_eq!(startable[0].object_path(), "/call/1");
        assert!(state.knows("/text/1"));
    }

    #[tokio::test]
    async fn test_bound_request_no_longer_blocks() {
        let mut state = state();
        let (mut pending, _rx) = request(ChannelKind::Text);
        pending.operation = Some(operation("/text/2", ChannelKind::Text));
        state.requests.push(pending);

        assert!(state.can_start(ChannelKind::Text));
        assert_eq!(state.take_requests_for("/text/2").len(), 1);
        assert!(state.requests.is_empty());
    }

    #[tokio::test]
    async fn test_forget_clears_every_map() {
        let mut state = state();
        state
            .dispatched
            .insert("/text/3".to_string(), DispatchedChannel { wrapper: None });
        state.outstanding.push(operation("/text/3", ChannelKind::Text));

        assert!(state.knows("/text/3"));
        assert!(state.forget("/text/3"));
        assert!(!state.knows("/text/3"));
        assert!(!state.forget("/text/3"));
    }
}
