//! Dispatch Operation
//!
//! One operation owns one channel from the moment it surfaces until a handler
//! claims it or the channel goes away. It waits for the channel (and its typed
//! wrapper) to become ready, then moves through approval and dispatch.
//!
//! State changes and their events happen under one lock, so a subscriber that
//! snapshots the state with [`DispatchOperation::watch`] never misses or
//! double-counts a transition. No lock is held across an `.await`.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use switchboard_traits::{
    Channel, ChannelError, ChannelKind, ChannelWrapper, ConnectionId, Contact, WrapperFactory,
    wait_invalidated,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::state::{OperationEvent, OperationState};
use super::wrapper::{build_wrapper, wait_wrapper_ready};

const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Everything a handler takes over when it claims an operation.
#[derive(Clone)]
pub struct ClaimedChannel {
    pub connection: ConnectionId,
    pub channel: Arc<dyn Channel>,
    pub wrapper: Option<ChannelWrapper>,
    pub contact: Option<Contact>,
}

impl ClaimedChannel {
    pub fn object_path(&self) -> &str {
        self.channel.object_path()
    }
}

impl std::fmt::Debug for ClaimedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedChannel")
            .field("connection", &self.connection)
            .field("channel", &self.channel.object_path())
            .field("wrapper", &self.wrapper)
            .field("contact", &self.contact)
            .finish()
    }
}

struct OperationInner {
    state: OperationState,
    approved: bool,
    channel: Option<Arc<dyn Channel>>,
    wrapper: Option<ChannelWrapper>,
    contact: Option<Contact>,
}

pub struct DispatchOperation {
    connection: ConnectionId,
    object_path: String,
    kind: ChannelKind,
    incoming: bool,
    inner: Mutex<OperationInner>,
    events: broadcast::Sender<OperationEvent>,
}

/// Builder for [`DispatchOperation`].
pub struct DispatchOperationBuilder {
    connection: ConnectionId,
    channel: Arc<dyn Channel>,
    wrapper: Option<ChannelWrapper>,
    contact: Option<Contact>,
    incoming: bool,
    event_capacity: usize,
}

impl DispatchOperationBuilder {
    pub fn incoming(mut self, incoming: bool) -> Self {
        self.incoming = incoming;
        self
    }

    pub fn contact(mut self, contact: Option<Contact>) -> Self {
        self.contact = contact;
        self
    }

    /// Reuse a wrapper that was already presented. It is assumed to be ready.
    pub fn wrapper(mut self, wrapper: ChannelWrapper) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Create the operation in PREPARING and start waiting for readiness.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self, factory: Arc<dyn WrapperFactory>) -> Arc<DispatchOperation> {
        let channel = self.channel.clone();
        let invalidated = channel.subscribe_invalidated();
        let operation = Arc::new(DispatchOperation {
            connection: self.connection,
            object_path: channel.object_path().to_string(),
            kind: channel.kind(),
            incoming: self.incoming,
            inner: Mutex::new(OperationInner {
                state: OperationState::Preparing,
                approved: false,
                channel: Some(self.channel),
                wrapper: self.wrapper,
                contact: self.contact,
            }),
            events: broadcast::channel(self.event_capacity).0,
        });

        tokio::spawn(DispatchOperation::run(
            Arc::downgrade(&operation),
            channel,
            invalidated,
            factory,
        ));

        operation
    }
}

impl DispatchOperation {
    pub fn builder(connection: ConnectionId, channel: Arc<dyn Channel>) -> DispatchOperationBuilder {
        let incoming = channel.is_incoming();
        DispatchOperationBuilder {
            connection,
            channel,
            wrapper: None,
            contact: None,
            incoming,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub fn is_approved(&self) -> bool {
        self.inner.lock().approved
    }

    /// The channel, until the operation is claimed or invalidated.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner.lock().channel.clone()
    }

    /// The typed wrapper, once built and until claimed or invalidated.
    pub fn wrapper(&self) -> Option<ChannelWrapper> {
        self.inner.lock().wrapper.clone()
    }

    pub fn contact(&self) -> Option<Contact> {
        self.inner.lock().contact.clone()
    }

    pub(crate) fn set_contact(&self, contact: Option<Contact>) {
        if contact.is_some() {
            self.inner.lock().contact = contact;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Current state plus a receiver for every event after it.
    pub fn watch(&self) -> (OperationState, broadcast::Receiver<OperationEvent>) {
        let inner = self.inner.lock();
        (inner.state, self.events.subscribe())
    }

    /// Leave PENDING: towards APPROVING for unapproved incoming channels,
    /// straight to DISPATCHING otherwise. Returns the resulting state.
    pub fn start(&self) -> OperationState {
        let mut inner = self.inner.lock();
        if inner.state != OperationState::Pending {
            warn!(
                "Cannot start dispatch operation {} in state {}",
                self.object_path, inner.state
            );
            return inner.state;
        }

        let next = if self.incoming && !inner.approved {
            OperationState::Approving
        } else {
            OperationState::Dispatching
        };
        self.transition(&mut inner, next);
        next
    }

    /// Approve the operation. Before APPROVING this is recorded for `start()`;
    /// after it, this is ignored.
    pub fn approve(&self) {
        let mut inner = self.inner.lock();
        match inner.state.cmp(&OperationState::Approving) {
            std::cmp::Ordering::Equal => {
                inner.approved = true;
                self.transition(&mut inner, OperationState::Dispatching);
                let _ = self.events.send(OperationEvent::Approved);
            }
            std::cmp::Ordering::Less => {
                if !inner.approved {
                    debug!("Dispatch operation {} pre-approved", self.object_path);
                    inner.approved = true;
                }
            }
            std::cmp::Ordering::Greater => {
                debug!(
                    "Ignoring approval of dispatch operation {} in state {}",
                    self.object_path, inner.state
                );
            }
        }
    }

    /// Take ownership of the channel. Succeeds at most once.
    pub fn claim(&self) -> Option<ClaimedChannel> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            debug!(
                "Dispatch operation {} cannot be claimed in state {}",
                self.object_path, inner.state
            );
            return None;
        }
        let channel = inner.channel.take()?;

        self.transition(&mut inner, OperationState::Claimed);
        let claimed = ClaimedChannel {
            connection: self.connection.clone(),
            channel,
            wrapper: inner.wrapper.take(),
            contact: inner.contact.clone(),
        };
        let _ = self.events.send(OperationEvent::Claimed);
        Some(claimed)
    }

    /// Move to INVALIDATED and release the channel. Idempotent.
    pub fn invalidate(&self, error: ChannelError) {
        let released = {
            let mut inner = self.inner.lock();
            if inner.state == OperationState::Invalidated {
                return;
            }
            debug!(
                "Dispatch operation {} invalidated: {}",
                self.object_path, error
            );
            self.transition(&mut inner, OperationState::Invalidated);
            let released = (inner.channel.take(), inner.wrapper.take());
            let _ = self.events.send(OperationEvent::Invalidated(error));
            released
        };
        drop(released);
    }

    fn transition(&self, inner: &mut OperationInner, to: OperationState) {
        debug!(
            "Dispatch operation {} state: {} -> {}",
            self.object_path, inner.state, to
        );
        inner.state = to;
    }

    /// PREPARING -> PENDING, unless something else happened meanwhile.
    fn mark_ready(&self) {
        let mut inner = self.inner.lock();
        if inner.state != OperationState::Preparing {
            return;
        }
        self.transition(&mut inner, OperationState::Pending);
        let _ = self.events.send(OperationEvent::Ready);
    }

    /// Store a freshly built wrapper unless one exists or the operation is over.
    fn install_wrapper(&self, wrapper: &ChannelWrapper) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.wrapper.is_some() {
            return false;
        }
        inner.wrapper = Some(wrapper.clone());
        true
    }

    async fn run(
        operation: Weak<Self>,
        channel: Arc<dyn Channel>,
        mut invalidated: tokio::sync::watch::Receiver<Option<ChannelError>>,
        factory: Arc<dyn WrapperFactory>,
    ) {
        let prepared = tokio::select! {
            biased;
            Some(error) = wait_invalidated(&mut invalidated) => Err(error),
            result = Self::prepare(&operation, channel, factory) => result,
        };

        match prepared {
            Ok(()) => {
                if let Some(operation) = operation.upgrade() {
                    operation.mark_ready();
                }
            }
            Err(error) => {
                if let Some(operation) = operation.upgrade() {
                    operation.invalidate(error);
                }
                return;
            }
        }

        // Invalidation wins in every state, including after a claim.
        if let Some(error) = wait_invalidated(&mut invalidated).await
            && let Some(operation) = operation.upgrade()
        {
            operation.invalidate(error);
        }
    }

    async fn prepare(
        operation: &Weak<Self>,
        channel: Arc<dyn Channel>,
        factory: Arc<dyn WrapperFactory>,
    ) -> Result<(), ChannelError> {
        channel.become_ready().await?;

        let Some(op) = operation.upgrade() else {
            return Ok(());
        };
        if op.inner.lock().wrapper.is_some() {
            return Ok(());
        }
        let Some(wrapper) = build_wrapper(op.kind, channel, factory.as_ref()) else {
            return Ok(());
        };
        if !op.install_wrapper(&wrapper) {
            return Ok(());
        }
        drop(op);

        let contact = wait_wrapper_ready(&wrapper).await?;
        if let Some(op) = operation.upgrade() {
            op.set_contact(contact);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DispatchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DispatchOperation")
            .field("connection", &self.connection)
            .field("object_path", &self.object_path)
            .field("kind", &self.kind)
            .field("incoming", &self.incoming)
            .field("state", &inner.state)
            .field("approved", &inner.approved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackChannel, LoopbackWrapperFactory};
    use std::time::Duration;
    use switchboard_traits::{Contact, TargetHandle};
    use tokio::time::timeout;

    async fn next_event(events: &mut broadcast::Receiver<OperationEvent>) -> OperationEvent {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for operation event")
            .expect("event bus closed")
    }

    async fn wait_for_state(operation: &DispatchOperation, state: OperationState) {
        timeout(Duration::from_secs(1), async {
            while operation.state() != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("state never reached");
    }

    fn connection() -> ConnectionId {
        ConnectionId::new("jabber/alice")
    }

    fn spawn_ready(
        channel: &Arc<LoopbackChannel>,
        factory: &Arc<LoopbackWrapperFactory>,
    ) -> Arc<DispatchOperation> {
        let channel: Arc<dyn Channel> = channel.clone();
        DispatchOperation::builder(connection(), channel).spawn(factory.clone())
    }

    #[tokio::test]
    async fn test_incoming_text_full_lifecycle() {
        let channel = LoopbackChannel::incoming("/text/1", ChannelKind::Text, TargetHandle::contact(2));
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        let mut events = operation.subscribe();

        assert_eq!(next_event(&mut events).await, OperationEvent::Ready);
        assert_eq!(operation.state(), OperationState::Pending);
        assert!(operation.wrapper().is_some());

        assert_eq!(operation.start(), OperationState::Approving);
        operation.approve();
        assert_eq!(operation.state(), OperationState::Dispatching);
        assert_eq!(next_event(&mut events).await, OperationEvent::Approved);

        let claimed = operation.claim().expect("first claim succeeds");
        assert_eq!(claimed.object_path(), "/text/1");
        assert!(claimed.wrapper.is_some());
        assert_eq!(operation.state(), OperationState::Claimed);
        assert_eq!(next_event(&mut events).await, OperationEvent::Claimed);

        assert!(operation.claim().is_none());
        assert!(operation.channel().is_none());
        assert!(operation.wrapper().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outgoing_skips_approval() {
        let channel = LoopbackChannel::outgoing(
            "/call/1",
            ChannelKind::StreamedMedia,
            TargetHandle::contact(3),
        );
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        assert!(!operation.is_incoming());

        wait_for_state(&operation, OperationState::Pending).await;
        assert_eq!(operation.start(), OperationState::Dispatching);
    }

    #[tokio::test]
    async fn test_pre_approval_skips_approving() {
        let channel = LoopbackChannel::incoming("/text/2", ChannelKind::Text, TargetHandle::contact(2));
        channel.defer_ready();
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);

        operation.approve();
        assert_eq!(operation.state(), OperationState::Preparing);
        assert!(operation.is_approved());

        channel.mark_ready();
        wait_for_state(&operation, OperationState::Pending).await;
        assert_eq!(operation.start(), OperationState::Dispatching);
    }

    #[tokio::test]
    async fn test_start_outside_pending_is_noop() {
        let channel = LoopbackChannel::incoming("/ft/1", ChannelKind::FileTransfer, TargetHandle::contact(2));
        channel.defer_ready();
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);

        assert_eq!(operation.start(), OperationState::Preparing);
        assert_eq!(operation.state(), OperationState::Preparing);
    }

    #[tokio::test]
    async fn test_approve_after_dispatching_is_ignored() {
        let channel = LoopbackChannel::outgoing("/ft/2", ChannelKind::FileTransfer, TargetHandle::contact(2));
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        let mut events = operation.subscribe();
        wait_for_state(&operation, OperationState::Pending).await;
        assert_eq!(next_event(&mut events).await, OperationEvent::Ready);

        operation.start();
        operation.approve();
        assert_eq!(operation.state(), OperationState::Dispatching);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_claim_while_pending() {
        let channel = LoopbackChannel::incoming("/text/3", ChannelKind::Text, TargetHandle::contact(2));
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        wait_for_state(&operation, OperationState::Pending).await;

        assert!(operation.claim().is_some());
        assert_eq!(operation.state(), OperationState::Claimed);
        assert_eq!(operation.start(), OperationState::Claimed);
    }

    #[tokio::test]
    async fn test_concurrent_claims_only_one_wins() {
        let channel = LoopbackChannel::incoming("/text/4", ChannelKind::Text, TargetHandle::contact(2));
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        wait_for_state(&operation, OperationState::Pending).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let operation = operation.clone();
                tokio::spawn(async move { operation.claim().is_some() })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_invalidation_is_idempotent() {
        let channel = LoopbackChannel::incoming("/text/5", ChannelKind::Text, TargetHandle::contact(2));
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        let mut events = operation.subscribe();
        assert_eq!(next_event(&mut events).await, OperationEvent::Ready);

        let error = ChannelError::new("test", 1, "gone");
        operation.invalidate(error.clone());
        operation.invalidate(ChannelError::new("test", 2, "gone again"));

        assert_eq!(
            next_event(&mut events).await,
            OperationEvent::Invalidated(error)
        );
        assert!(events.try_recv().is_err());
        assert_eq!(operation.state(), OperationState::Invalidated);
        assert!(operation.channel().is_none());
        assert!(operation.claim().is_none());
    }

    #[tokio::test]
    async fn test_channel_invalidation_interrupts_preparation() {
        let channel = LoopbackChannel::incoming("/text/6", ChannelKind::Text, TargetHandle::contact(2));
        channel.defer_ready();
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        let mut events = operation.subscribe();

        let error = ChannelError::new("org.example", 4, "Remote hung up");
        channel.invalidate(error.clone());

        assert_eq!(
            next_event(&mut events).await,
            OperationEvent::Invalidated(error)
        );
        channel.mark_ready();
        tokio::task::yield_now().await;
        assert_eq!(operation.state(), OperationState::Invalidated);
    }

    #[tokio::test]
    async fn test_readiness_failure_invalidates() {
        let channel = LoopbackChannel::incoming("/text/7", ChannelKind::Text, TargetHandle::contact(2));
        channel.defer_ready();
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        let mut events = operation.subscribe();

        let error = ChannelError::new("org.example", 5, "Not available");
        channel.fail_ready(error.clone());

        assert_eq!(
            next_event(&mut events).await,
            OperationEvent::Invalidated(error)
        );
    }

    #[tokio::test]
    async fn test_chat_readiness_holds_preparing() {
        let channel = LoopbackChannel::outgoing("/text/8", ChannelKind::Text, TargetHandle::contact(2));
        let factory = Arc::new(LoopbackWrapperFactory::new().defer_chat_ready());
        let operation = spawn_ready(&channel, &factory);

        let chat = timeout(Duration::from_secs(1), async {
            loop {
                if let Some(chat) = factory.chat_for("/text/8") {
                    return chat;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(operation.state(), OperationState::Preparing);

        chat.resolve("conversation-8");
        wait_for_state(&operation, OperationState::Pending).await;
    }

    #[tokio::test]
    async fn test_outgoing_call_waits_for_contact() {
        let channel = LoopbackChannel::outgoing(
            "/call/2",
            ChannelKind::StreamedMedia,
            TargetHandle::contact(9),
        );
        let factory = Arc::new(LoopbackWrapperFactory::new().defer_call_contact());
        let operation = spawn_ready(&channel, &factory);

        let call = timeout(Duration::from_secs(1), async {
            loop {
                if let Some(call) = factory.call_for("/call/2") {
                    return call;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(operation.state(), OperationState::Preparing);
        assert!(operation.contact().is_none());

        call.resolve_contact(Contact::new("bob@example.org", 9));
        wait_for_state(&operation, OperationState::Pending).await;
        assert_eq!(operation.contact().map(|c| c.handle), Some(9));
        assert_eq!(operation.start(), OperationState::Dispatching);
    }

    #[tokio::test]
    async fn test_prebuilt_wrapper_skips_wrapper_readiness() {
        let factory = Arc::new(LoopbackWrapperFactory::new().defer_chat_ready());
        let channel = LoopbackChannel::outgoing("/text/9", ChannelKind::Text, TargetHandle::contact(2));
        let dyn_channel: Arc<dyn Channel> = channel.clone();
        let wrapper = ChannelWrapper::Chat(factory.chat(dyn_channel.clone()));

        let operation = DispatchOperation::builder(connection(), dyn_channel)
            .wrapper(wrapper)
            .spawn(factory.clone());

        wait_for_state(&operation, OperationState::Pending).await;
    }

    fn event_state(event: &OperationEvent) -> OperationState {
        match event {
            OperationEvent::Ready => OperationState::Pending,
            OperationEvent::Approved => OperationState::Dispatching,
            OperationEvent::Claimed => OperationState::Claimed,
            OperationEvent::Invalidated(_) => OperationState::Invalidated,
        }
    }

    fn assert_non_decreasing(states: &[OperationState]) {
        assert!(
            states.windows(2).all(|pair| pair[0] <= pair[1]),
            "states went backwards: {:?}",
            states
        );
    }

    #[tokio::test]
    async fn test_invalidation_from_every_state_keeps_order() {
        let targets = [
            OperationState::Preparing,
            OperationState::Pending,
            OperationState::Approving,
            OperationState::Dispatching,
            OperationState::Claimed,
        ];
        for (index, target) in targets.into_iter().enumerate() {
            let path = format!("/text/order{index}");
            let channel = LoopbackChannel::incoming(path.clone(), ChannelKind::Text, TargetHandle::contact(2));
            if target == OperationState::Preparing {
                channel.defer_ready();
            }
            let factory = Arc::new(LoopbackWrapperFactory::new());
            let operation = spawn_ready(&channel, &factory);
            let (initial, mut events) = operation.watch();

            let mut polled = vec![initial];
            if target >= OperationState::Pending {
                wait_for_state(&operation, OperationState::Pending).await;
                polled.push(operation.state());
            }
            if target >= OperationState::Approving {
                polled.push(operation.start());
            }
            if target >= OperationState::Dispatching {
                operation.approve();
                polled.push(operation.state());
            }
            if target == OperationState::Claimed {
                assert!(operation.claim().is_some());
                polled.push(operation.state());
            }
            assert_eq!(operation.state(), target, "{path}");

            channel.invalidate(ChannelError::new("test", 7, "gone"));
            wait_for_state(&operation, OperationState::Invalidated).await;
            operation.invalidate(ChannelError::closed());
            polled.push(operation.state());

            let mut announced = vec![initial];
            let mut invalidations = 0;
            while let Ok(Ok(event)) = timeout(Duration::from_millis(50), events.recv()).await {
                if matches!(event, OperationEvent::Invalidated(_)) {
                    invalidations += 1;
                }
                announced.push(event_state(&event));
            }

            assert_non_decreasing(&polled);
            assert_non_decreasing(&announced);
            assert_eq!(invalidations, 1, "{path} from {target}");
            assert_eq!(announced.last(), Some(&OperationState::Invalidated));
            assert!(operation.claim().is_none());
            assert!(operation.channel().is_none());
        }
    }

    #[tokio::test]
    async fn test_channel_invalidated_after_claim() {
        let channel = LoopbackChannel::incoming("/text/10", ChannelKind::Text, TargetHandle::contact(2));
        let factory = Arc::new(LoopbackWrapperFactory::new());
        let operation = spawn_ready(&channel, &factory);
        wait_for_state(&operation, OperationState::Pending).await;
        assert!(operation.claim().is_some());

        channel.invalidate(ChannelError::closed());
        wait_for_state(&operation, OperationState::Invalidated).await;
    }
}
