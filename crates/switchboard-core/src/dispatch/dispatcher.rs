//! Dispatcher
//!
//! Follows every attached connection, creates a [`DispatchOperation`] per new
//! channel and drives it: observers see it at PENDING, approvers get first
//! refusal on incoming channels, and handlers claim it once it is dispatching.
//! Tube channels bypass operations and are handled sub-tube by sub-tube.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use switchboard_traits::{
    Channel, ChannelError, ChannelKind, ChannelWrapper, Connection, ConnectionId, Contact,
    ContactResolver, ReceivedMessage, TargetHandle, TubeDescriptor, TubeEvent,
    TubeHandlerDirectory, TubeInfo, TubeState, WrapperFactory, wait_invalidated,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection_state::{ConnectionState, DispatchedChannel, PendingRequest};
use super::events::DispatcherEvent;
use super::operation::DispatchOperation;
use super::state::{OperationEvent, OperationState};
use super::tubes::{TubeRecord, handler_bus_name, handler_object_path};
use crate::config::{DispatcherConfig, OutgoingTextPolicy};
use crate::error::{DispatchError, Result};

/// Collaborators the dispatcher consumes.
#[derive(Clone)]
pub struct DispatcherDeps {
    pub contacts: Arc<dyn ContactResolver>,
    pub wrappers: Arc<dyn WrapperFactory>,
    pub tube_handlers: Arc<dyn TubeHandlerDirectory>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    deps: DispatcherDeps,
    connections: Mutex<HashMap<ConnectionId, ConnectionState>>,
    events: broadcast::Sender<DispatcherEvent>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, deps: DispatcherDeps) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.capacity());
        Arc::new(Self {
            config,
            deps,
            connections: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.events.subscribe()
    }

    /// Attach a connection. Its channels are followed once it becomes ready.
    pub fn add_connection(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        info!("Attaching connection {}", connection.id());
        tokio::spawn(Self::run_connection(Arc::downgrade(self), connection));
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the channels that existed before attaching have been processed.
    pub fn is_backlog_drained(&self, connection: &ConnectionId) -> bool {
        self.connections
            .lock()
            .get(connection)
            .is_some_and(|state| state.backlog_drained)
    }

    pub fn is_dispatched(&self, connection: &ConnectionId, object_path: &str) -> bool {
        self.connections
            .lock()
            .get(connection)
            .is_some_and(|state| state.dispatched.contains_key(object_path))
    }

    /// Operation in flight or held back for the channel.
    pub fn operation(
        &self,
        connection: &ConnectionId,
        object_path: &str,
    ) -> Option<Arc<DispatchOperation>> {
        let connections = self.connections.lock();
        let state = connections.get(connection)?;
        state.dispatching.get(object_path).cloned().or_else(|| {
            state
                .outstanding
                .iter()
                .find(|operation| operation.object_path() == object_path)
                .cloned()
        })
    }

    /// Open sub-tubes of a tube channel.
    pub fn tube_count(&self, connection: &ConnectionId, object_path: &str) -> Option<usize> {
        self.connections
            .lock()
            .get(connection)?
            .tubes
            .get(object_path)
            .map(TubeRecord::count)
    }

    /// Ask a connection for a channel and wait until its operation is PENDING.
    ///
    /// The operation is pre-approved. Incoming channels of the same kind are
    /// held back until the middleware answered the request.
    pub async fn request_channel(
        self: &Arc<Self>,
        connection_id: &ConnectionId,
        kind: ChannelKind,
        target: TargetHandle,
        contact: Option<Contact>,
    ) -> Result<Arc<DispatchOperation>> {
        let request_id = Uuid::new_v4();
        let (reply, response) = oneshot::channel();
        let connection = {
            let mut connections = self.connections.lock();
            let state = connections
                .get_mut(connection_id)
                .ok_or_else(|| DispatchError::UnknownConnection(connection_id.clone()))?;
            state.requests.push(PendingRequest {
                id: request_id,
                kind,
                operation: None,
                reply,
            });
            state.connection.clone()
        };
        debug!(
            "Requesting {} channel to handle {} on {}",
            kind, target.handle, connection_id
        );

        let contact = match contact {
            Some(contact) => Some(contact),
            None => self.resolve_contact(connection_id, target).await,
        };

        match connection.request_channel(kind, target).await {
            Ok(channel) => self.bind_request(connection_id, request_id, channel, contact),
            Err(error) => {
                debug!("Channel request failed: {}", error);
                let startable = {
                    let mut connections = self.connections.lock();
                    match connections.get_mut(connection_id) {
                        Some(state) => {
                            state.take_request(request_id);
                            let startable = state.take_startable();
                            self.move_to_dispatching(state, startable)
                        }
                        None => Vec::new(),
                    }
                };
                self.spawn_drivers(startable);
                return Err(error.into());
            }
        }

        response.await.map_err(|_| DispatchError::RequestCancelled)?
    }

    /// Hand a tube to its handler, closing it if there is none or it fails.
    pub async fn process_tube(&self, tube: &TubeDescriptor) {
        if tube.activatable {
            debug!("Dispatching tube {} to {}", tube.tube_id, tube.bus_name);
            match self.deps.tube_handlers.handle_tube(tube).await {
                Ok(()) => return,
                Err(error) => warn!("Tube handler {} failed: {}", tube.bus_name, error),
            }
        }
        self.close_tube(tube).await;
    }

    /// Refuse a tube.
    pub async fn decline_tube(&self, tube: &TubeDescriptor) {
        debug!("Declining tube {} on {}", tube.tube_id, tube.channel_path());
        self.close_tube(tube).await;
    }

    async fn close_tube(&self, tube: &TubeDescriptor) {
        if let Err(error) = tube.channel.close_tube(tube.tube_id).await {
            warn!(
                "Failed to close tube {} on {}: {}",
                tube.tube_id,
                tube.channel_path(),
                error
            );
        }
    }

    fn emit(&self, event: DispatcherEvent) {
        debug!("Dispatcher event: {}", event.name());
        let _ = self.events.send(event);
    }

    async fn resolve_contact(
        &self,
        connection: &ConnectionId,
        target: TargetHandle,
    ) -> Option<Contact> {
        if !target.is_contact() {
            return None;
        }
        self.deps.contacts.lookup(connection, target.handle).await
    }

    fn build_operation(
        &self,
        connection: &ConnectionId,
        channel: Arc<dyn Channel>,
        incoming: bool,
        contact: Option<Contact>,
        wrapper: Option<ChannelWrapper>,
    ) -> Arc<DispatchOperation> {
        let builder = DispatchOperation::builder(connection.clone(), channel)
            .incoming(incoming)
            .contact(contact)
            .event_capacity(self.config.capacity());
        let builder = match wrapper {
            Some(wrapper) => builder.wrapper(wrapper),
            None => builder,
        };
        builder.spawn(self.deps.wrappers.clone())
    }

    // ---------------------------------------------------------------
    // Connections
    // ---------------------------------------------------------------

    async fn run_connection(dispatcher: Weak<Self>, connection: Arc<dyn Connection>) {
        let id = connection.id().clone();
        let mut invalidated = connection.subscribe_invalidated();

        let ready = tokio::select! {
            biased;
            Some(error) = wait_invalidated(&mut invalidated) => Err(error),
            result = connection.become_ready() => result,
        };
        let Some(this) = dispatcher.upgrade() else {
            return;
        };
        if let Err(error) = ready {
            warn!("Connection {} failed to become ready: {}", id, error);
            this.connection_lost(&id, error);
            return;
        }

        {
            let mut connections = this.connections.lock();
            if connections.contains_key(&id) {
                warn!("Connection {} is already attached", id);
                return;
            }
            connections.insert(id.clone(), ConnectionState::new(connection.clone()));
        }
        info!("Connection {} ready", id);

        // Subscribe before listing so nothing falls between the two.
        let mut live = connection.new_channels();
        match connection.list_channels().await {
            Ok(channels) => {
                for channel in channels {
                    this.handle_new_channel(&id, channel).await;
                }
            }
            Err(error) => warn!("Failed to list channels on {}: {}", id, error),
        }
        if let Some(state) = this.connections.lock().get_mut(&id) {
            state.backlog_drained = true;
        }
        info!("Connection {} backlog drained", id);
        drop(this);

        let error = loop {
            tokio::select! {
                biased;
                Some(error) = wait_invalidated(&mut invalidated) => break error,
                next = live.next() => {
                    let Some(channel) = next else {
                        break ChannelError::disconnected();
                    };
                    let Some(this) = dispatcher.upgrade() else {
                        return;
                    };
                    this.handle_new_channel(&id, channel).await;
                }
            }
        };

        if let Some(this) = dispatcher.upgrade() {
            this.connection_lost(&id, error);
        }
    }

    fn connection_lost(&self, id: &ConnectionId, error: ChannelError) {
        let state = self.connections.lock().remove(id);
        if let Some(state) = state {
            info!("Connection {} lost: {}", id, error);
            for request in state.requests {
                let _ = request.reply.send(Err(DispatchError::RequestCancelled));
            }
        }
        self.emit(DispatcherEvent::ConnectionLost {
            connection: id.clone(),
            error,
        });
    }

    // ---------------------------------------------------------------
    // Channels
    // ---------------------------------------------------------------

    async fn handle_new_channel(self: &Arc<Self>, id: &ConnectionId, channel: Arc<dyn Channel>) {
        let path = channel.object_path().to_string();
        {
            let connections = self.connections.lock();
            let Some(state) = connections.get(id) else {
                return;
            };
            if state.knows(&path) {
                debug!("Ignoring known channel {}", path);
                return;
            }
        }

        let kind = channel.kind();
        debug!("New {} channel {} on {}", kind, path, id);
        if kind == ChannelKind::Tube {
            self.handle_tube_channel(id, channel);
            return;
        }

        let contact = self.resolve_contact(id, channel.target()).await;
        let incoming = channel.is_incoming();
        let operation = self.build_operation(id, channel.clone(), incoming, contact, None);

        let start = {
            let mut connections = self.connections.lock();
            let Some(state) = connections.get_mut(id) else {
                return;
            };
            if state.knows(&path) {
                return;
            }
            // A remote party or one of our requests; wait until requests of
            // this kind are answered before deciding.
            if incoming && !state.can_start(kind) {
                debug!("Holding back {} until pending requests are answered", path);
                state.outstanding.push(operation.clone());
                false
            } else {
                state.dispatching.insert(path, operation.clone());
                true
            }
        };

        self.watch_channel(id, &channel);
        if start {
            self.spawn_drivers(vec![operation]);
        }
    }

    /// Forget a channel once it is invalidated and fail its requests.
    fn watch_channel(self: &Arc<Self>, id: &ConnectionId, channel: &Arc<dyn Channel>) {
        let dispatcher = Arc::downgrade(self);
        let id = id.clone();
        let path = channel.object_path().to_string();
        let mut invalidated = channel.subscribe_invalidated();
        tokio::spawn(async move {
            let Some(error) = wait_invalidated(&mut invalidated).await else {
                return;
            };
            let Some(this) = dispatcher.upgrade() else {
                return;
            };
            debug!("Channel {} went away: {}", path, error);
            let requests = {
                let mut connections = this.connections.lock();
                let Some(state) = connections.get_mut(&id) else {
                    return;
                };
                state.forget(&path);
                state.take_requests_for(&path)
            };
            for request in requests {
                let _ = request.reply.send(Err(error.clone().into()));
            }
        });
    }

    fn bind_request(
        self: &Arc<Self>,
        id: &ConnectionId,
        request_id: Uuid,
        channel: Arc<dyn Channel>,
        contact: Option<Contact>,
    ) {
        let path = channel.object_path().to_string();
        let mut watch = false;
        let mut already_dispatching = false;

        let (operation, startable) = {
            let mut connections = self.connections.lock();
            let Some(state) = connections.get_mut(id) else {
                return;
            };
            let Some(index) = state.requests.iter().position(|r| r.id == request_id) else {
                return;
            };

            let mut to_start = Vec::new();
            let operation = if let Some(operation) = state.take_outstanding(&path) {
                to_start.push(operation.clone());
                operation
            } else if let Some(operation) = state.dispatching.get(&path) {
                already_dispatching = true;
                operation.clone()
            } else {
                let wrapper = match state.dispatched.get(&path) {
                    Some(dispatched) => dispatched.wrapper.clone(),
                    None => {
                        watch = true;
                        None
                    }
                };
                let operation =
                    self.build_operation(id, channel.clone(), false, contact.clone(), wrapper);
                to_start.push(operation.clone());
                operation
            };

            operation.set_contact(contact);
            state.requests[index].operation = Some(operation.clone());
            to_start.extend(state.take_startable());
            let startable = self.move_to_dispatching(state, to_start);
            (operation, startable)
        };

        // We asked for it.
        operation.approve();

        if watch {
            self.watch_channel(id, &channel);
        }
        self.spawn_drivers(startable);

        if already_dispatching {
            match operation.state() {
                OperationState::Preparing => {}
                OperationState::Invalidated => {
                    self.flush_requests(&operation, Err(ChannelError::closed()))
                }
                _ => self.flush_requests(&operation, Ok(())),
            }
        }
    }

    fn move_to_dispatching(
        &self,
        state: &mut ConnectionState,
        operations: Vec<Arc<DispatchOperation>>,
    ) -> Vec<Arc<DispatchOperation>> {
        for operation in &operations {
            debug!("Dispatching process started for {}", operation.object_path());
            state
                .dispatching
                .insert(operation.object_path().to_string(), operation.clone());
        }
        operations
    }

    fn flush_requests(
        &self,
        operation: &Arc<DispatchOperation>,
        result: std::result::Result<(), ChannelError>,
    ) {
        let requests = {
            let mut connections = self.connections.lock();
            match connections.get_mut(operation.connection()) {
                Some(state) => state.take_requests_for(operation.object_path()),
                None => return,
            }
        };
        for request in requests {
            let reply = match &result {
                Ok(()) => Ok(operation.clone()),
                Err(error) => Err(error.clone().into()),
            };
            let _ = request.reply.send(reply);
        }
    }

    // ---------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------

    fn spawn_drivers(self: &Arc<Self>, operations: Vec<Arc<DispatchOperation>>) {
        for operation in operations {
            tokio::spawn(Self::drive_operation(Arc::downgrade(self), operation));
        }
    }

    async fn drive_operation(dispatcher: Weak<Self>, operation: Arc<DispatchOperation>) {
        let (state, mut events) = operation.watch();
        let mut presented = None;

        match state {
            OperationState::Preparing => {}
            OperationState::Pending => {
                let Some(this) = dispatcher.upgrade() else {
                    return;
                };
                presented = operation.wrapper();
                this.operation_ready(&operation);
            }
            OperationState::Claimed => {
                if let Some(this) = dispatcher.upgrade() {
                    this.operation_claimed(&operation, None);
                }
                return;
            }
            OperationState::Invalidated => {
                if let Some(this) = dispatcher.upgrade() {
                    this.operation_invalidated(&operation, ChannelError::closed());
                }
                return;
            }
            OperationState::Approving | OperationState::Dispatching => {
                warn!(
                    "Dispatch operation {} already {} before dispatching started",
                    operation.object_path(),
                    state
                );
            }
        }

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Dispatch operation {} dropped {} events",
                        operation.object_path(),
                        skipped
                    );
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            let Some(this) = dispatcher.upgrade() else {
                return;
            };

            match event {
                OperationEvent::Ready => {
                    presented = operation.wrapper();
                    this.operation_ready(&operation);
                }
                OperationEvent::Approved => {
                    this.emit(DispatcherEvent::DispatchChannel(operation.clone()));
                }
                OperationEvent::Claimed => {
                    this.operation_claimed(&operation, presented);
                    return;
                }
                OperationEvent::Invalidated(error) => {
                    this.operation_invalidated(&operation, error);
                    return;
                }
            }
        }
    }

    fn operation_ready(self: &Arc<Self>, operation: &Arc<DispatchOperation>) {
        self.emit(DispatcherEvent::Observe(operation.clone()));
        let state = operation.start();
        self.flush_requests(operation, Ok(()));

        match state {
            OperationState::Approving => {
                self.emit(DispatcherEvent::FilterChannel(operation.clone()));
            }
            OperationState::Dispatching => self.dispatch(operation),
            _ => {}
        }
    }

    fn dispatch(self: &Arc<Self>, operation: &Arc<DispatchOperation>) {
        let hold_for_message = self.config.outgoing_text == OutgoingTextPolicy::AwaitFirstMessage
            && operation.kind() == ChannelKind::Text
            && !operation.is_incoming();

        if hold_for_message
            && let Some(ChannelWrapper::Chat(chat)) = operation.wrapper()
        {
            // Subscribe before looking at the backlog so nothing slips between.
            let messages = chat.subscribe_messages();
            if !chat.pending_messages().is_empty() {
                debug!(
                    "Outgoing text channel {} already has pending messages",
                    operation.object_path()
                );
                self.emit(DispatcherEvent::DispatchChannel(operation.clone()));
                return;
            }
            debug!(
                "Holding outgoing text channel {} until the first message",
                operation.object_path()
            );
            let events = operation.subscribe();
            tokio::spawn(Self::await_first_message(
                Arc::downgrade(self),
                operation.clone(),
                messages,
                events,
            ));
            return;
        }

        self.emit(DispatcherEvent::DispatchChannel(operation.clone()));
    }

    async fn await_first_message(
        dispatcher: Weak<Self>,
        operation: Arc<DispatchOperation>,
        mut messages: broadcast::Receiver<ReceivedMessage>,
        mut events: broadcast::Receiver<OperationEvent>,
    ) {
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Ok(_) | Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return,
                },
                event = events.recv() => match event {
                    Ok(OperationEvent::Claimed | OperationEvent::Invalidated(_))
                    | Err(RecvError::Closed) => return,
                    _ => {}
                },
            }
        }

        if operation.state() == OperationState::Dispatching
            && let Some(this) = dispatcher.upgrade()
        {
            this.emit(DispatcherEvent::DispatchChannel(operation));
        }
    }

    fn operation_claimed(
        &self,
        operation: &Arc<DispatchOperation>,
        wrapper: Option<ChannelWrapper>,
    ) {
        let path = operation.object_path();
        debug!("Channel {} claimed", path);
        {
            let mut connections = self.connections.lock();
            let Some(state) = connections.get_mut(operation.connection()) else {
                return;
            };
            remove_operation(state, operation);
            state
                .dispatched
                .insert(path.to_string(), DispatchedChannel { wrapper });
        }
        // Claimed before it ever became ready.
        self.flush_requests(operation, Ok(()));
    }

    fn operation_invalidated(&self, operation: &Arc<DispatchOperation>, error: ChannelError) {
        {
            let mut connections = self.connections.lock();
            if let Some(state) = connections.get_mut(operation.connection()) {
                remove_operation(state, operation);
            }
        }
        self.flush_requests(operation, Err(error));
    }

    // ---------------------------------------------------------------
    // Tubes
    // ---------------------------------------------------------------

    fn handle_tube_channel(self: &Arc<Self>, id: &ConnectionId, channel: Arc<dyn Channel>) {
        let path = channel.object_path().to_string();
        let Some(tube_events) = channel.subscribe_tube_events() else {
            warn!("Tube channel {} does not report tubes", path);
            return;
        };
        {
            let mut connections = self.connections.lock();
            let Some(state) = connections.get_mut(id) else {
                return;
            };
            if state.tubes.contains_key(&path) {
                return;
            }
            state.tubes.insert(path.clone(), TubeRecord::new());
        }
        tokio::spawn(Self::run_tube_channel(
            Arc::downgrade(self),
            id.clone(),
            channel,
            tube_events,
        ));
    }

    async fn run_tube_channel(
        dispatcher: Weak<Self>,
        id: ConnectionId,
        channel: Arc<dyn Channel>,
        mut tube_events: broadcast::Receiver<TubeEvent>,
    ) {
        let path = channel.object_path().to_string();
        let mut invalidated = channel.subscribe_invalidated();

        match channel.list_tubes().await {
            Ok(tubes) => {
                for tube in tubes {
                    let Some(this) = dispatcher.upgrade() else {
                        return;
                    };
                    this.tube_opened(&id, &channel, tube).await;
                }
            }
            Err(error) => debug!("Failed to list tubes on {}: {}", path, error),
        }

        loop {
            tokio::select! {
                biased;
                Some(error) = wait_invalidated(&mut invalidated) => {
                    debug!("Tube channel {} went away: {}", path, error);
                    if let Some(this) = dispatcher.upgrade() {
                        let mut connections = this.connections.lock();
                        if let Some(state) = connections.get_mut(&id) {
                            state.tubes.remove(&path);
                        }
                    }
                    return;
                }
                event = tube_events.recv() => {
                    let Some(this) = dispatcher.upgrade() else {
                        return;
                    };
                    match event {
                        Ok(TubeEvent::New(tube)) => this.tube_opened(&id, &channel, tube).await,
                        Ok(TubeEvent::Closed { id: tube_id }) => {
                            this.tube_closed(&id, &channel, tube_id).await
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Tube channel {} dropped {} events", path, skipped)
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn tube_opened(&self, id: &ConnectionId, channel: &Arc<dyn Channel>, tube: TubeInfo) {
        let path = channel.object_path();
        let count = {
            let mut connections = self.connections.lock();
            let Some(record) = connections
                .get_mut(id)
                .and_then(|state| state.tubes.get_mut(path))
            else {
                return;
            };
            if !record.opened(tube.id) {
                if record.is_parent_closed() {
                    debug!("Ignoring tube {} on closed channel {}", tube.id, path);
                }
                return;
            }
            record.count()
        };
        debug!("Increased tube count for {}: {}", path, count);

        // Only tubes offered to us need a handler.
        if tube.state != TubeState::LocalPending {
            return;
        }

        let bus_name = handler_bus_name(
            &self.config.tube_handler_namespace,
            tube.tube_type,
            &tube.service,
        );
        let mut descriptor = TubeDescriptor {
            connection: id.clone(),
            channel: channel.clone(),
            tube_id: tube.id,
            initiator_handle: tube.initiator,
            initiator: self.deps.contacts.lookup(id, tube.initiator).await,
            service: tube.service,
            tube_type: tube.tube_type,
            object_path: handler_object_path(&bus_name),
            bus_name,
            activatable: false,
        };

        debug!("Looking for tube handler: {}", descriptor.bus_name);
        if self.deps.tube_handlers.is_running(&descriptor.bus_name).await {
            debug!("Tube handler {} running", descriptor.bus_name);
            descriptor.activatable = true;
            self.process_tube(&descriptor).await;
            return;
        }

        match self.deps.tube_handlers.activatable_names().await {
            Ok(names) => {
                descriptor.activatable = names.iter().any(|name| *name == descriptor.bus_name);
            }
            Err(error) => debug!("Failed to list activatable names: {}", error),
        }
        if !descriptor.activatable {
            debug!("No tube handler for {}", descriptor.bus_name);
        }

        self.emit(DispatcherEvent::FilterTube(descriptor));
    }

    async fn tube_closed(&self, id: &ConnectionId, channel: &Arc<dyn Channel>, tube_id: u32) {
        let path = channel.object_path();
        let close_parent = {
            let mut connections = self.connections.lock();
            let Some(record) = connections
                .get_mut(id)
                .and_then(|state| state.tubes.get_mut(path))
            else {
                return;
            };
            let close = record.closed(tube_id);
            debug!("Decreased tube count for {}: {}", path, record.count());
            close
        };

        if close_parent {
            debug!("No more tubes, closing channel {}", path);
            if let Err(error) = channel.close().await {
                warn!("Failed to close tube channel {}: {}", path, error);
            }
        }
    }
}

fn remove_operation(state: &mut ConnectionState, operation: &Arc<DispatchOperation>) {
    let path = operation.object_path();
    if state
        .dispatching
        .get(path)
        .is_some_and(|current| Arc::ptr_eq(current, operation))
    {
        state.dispatching.remove(path);
    }
    if let Some(index) = state
        .outstanding
        .iter()
        .position(|current| Arc::ptr_eq(current, operation))
    {
        state.outstanding.remove(index);
    }
}
