//! In-memory middleware.
//!
//! Implements every seam the dispatcher consumes without a real messaging
//! stack. Readiness, invalidation and sub-tubes are driven by hand, which is
//! what the test suite and the `switchboard simulate` command need.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use switchboard_traits::{
    CallChannel, Channel, ChannelError, ChannelKind, ChannelStream, ChatChannel, Connection,
    ConnectionId, Contact, ContactResolver, FileOffer, FileTransferChannel, ReceivedMessage,
    TargetHandle, TubeDescriptor, TubeEvent, TubeHandlerDirectory, TubeInfo, WrapperFactory,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Waiting,
    Ready,
    Failed(ChannelError),
}

impl Readiness {
    async fn wait(sender: &watch::Sender<Readiness>) -> Result<(), ChannelError> {
        let mut receiver = sender.subscribe();
        let readiness = receiver
            .wait_for(|readiness| *readiness != Readiness::Waiting)
            .await
            .map_err(|_| ChannelError::closed())?;
        match &*readiness {
            Readiness::Failed(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }
}

fn invalidate_once(sender: &watch::Sender<Option<ChannelError>>, error: ChannelError) -> bool {
    sender.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(error);
        true
    })
}

fn kind_slug(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Text => "text",
        ChannelKind::StreamedMedia => "call",
        ChannelKind::FileTransfer => "file",
        ChannelKind::Tube => "tube",
    }
}

// ---------------------------------------------------------------
// Channel
// ---------------------------------------------------------------

pub struct LoopbackChannel {
    object_path: String,
    kind: ChannelKind,
    target: TargetHandle,
    requested: bool,
    ready: watch::Sender<Readiness>,
    invalidated: watch::Sender<Option<ChannelError>>,
    tube_events: broadcast::Sender<TubeEvent>,
    tubes: Mutex<Vec<TubeInfo>>,
    closed_tubes: Mutex<Vec<u32>>,
    close_count: AtomicUsize,
    tube_events_muted: AtomicBool,
}

impl LoopbackChannel {
    pub fn new(
        object_path: impl Into<String>,
        kind: ChannelKind,
        target: TargetHandle,
        requested: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            object_path: object_path.into(),
            kind,
            target,
            requested,
            ready: watch::channel(Readiness::Ready).0,
            invalidated: watch::channel(None).0,
            tube_events: broadcast::channel(EVENT_CAPACITY).0,
            tubes: Mutex::new(Vec::new()),
            closed_tubes: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            tube_events_muted: AtomicBool::new(false),
        })
    }

    pub fn incoming(object_path: impl Into<String>, kind: ChannelKind, target: TargetHandle) -> Arc<Self> {
        Self::new(object_path, kind, target, false)
    }

    pub fn outgoing(object_path: impl Into<String>, kind: ChannelKind, target: TargetHandle) -> Arc<Self> {
        Self::new(object_path, kind, target, true)
    }

    /// Hold `become_ready` until [`LoopbackChannel::mark_ready`].
    pub fn defer_ready(&self) {
        self.ready.send_replace(Readiness::Waiting);
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(Readiness::Ready);
    }

    pub fn fail_ready(&self, error: ChannelError) {
        self.ready.send_replace(Readiness::Failed(error));
    }

    pub fn invalidate(&self, error: ChannelError) {
        if invalidate_once(&self.invalidated, error) {
            debug!("Loopback channel {} invalidated", self.object_path);
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.borrow().is_some()
    }

    /// How many times `close` was called.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Behave like a tube channel that cannot report its sub-tubes.
    pub fn mute_tube_events(&self) {
        self.tube_events_muted.store(true, Ordering::SeqCst);
    }

    /// Add a sub-tube that already exists, without a notification.
    pub fn add_tube(&self, tube: TubeInfo) {
        self.tubes.lock().push(tube);
    }

    /// Open a sub-tube and notify.
    pub fn open_tube(&self, tube: TubeInfo) {
        self.tubes.lock().push(tube.clone());
        let _ = self.tube_events.send(TubeEvent::New(tube));
    }

    /// Close a sub-tube from the remote side.
    pub fn remove_tube(&self, tube_id: u32) {
        let removed = {
            let mut tubes = self.tubes.lock();
            let before = tubes.len();
            tubes.retain(|tube| tube.id != tube_id);
            tubes.len() != before
        };
        if removed {
            let _ = self.tube_events.send(TubeEvent::Closed { id: tube_id });
        }
    }

    /// Sub-tubes closed locally through `close_tube`.
    pub fn closed_tubes(&self) -> Vec<u32> {
        self.closed_tubes.lock().clone()
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn object_path(&self) -> &str {
        &self.object_path
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn target(&self) -> TargetHandle {
        self.target
    }

    fn requested(&self) -> bool {
        self.requested
    }

    async fn become_ready(&self) -> Result<(), ChannelError> {
        Readiness::wait(&self.ready).await
    }

    fn subscribe_invalidated(&self) -> watch::Receiver<Option<ChannelError>> {
        self.invalidated.subscribe()
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.invalidate(ChannelError::closed());
        Ok(())
    }

    fn subscribe_tube_events(&self) -> Option<broadcast::Receiver<TubeEvent>> {
        let reports = self.kind == ChannelKind::Tube && !self.tube_events_muted.load(Ordering::SeqCst);
        reports.then(|| self.tube_events.subscribe())
    }

    async fn list_tubes(&self) -> Result<Vec<TubeInfo>, ChannelError> {
        Ok(self.tubes.lock().clone())
    }

    async fn close_tube(&self, tube_id: u32) -> Result<(), ChannelError> {
        self.closed_tubes.lock().push(tube_id);
        self.remove_tube(tube_id);
        Ok(())
    }
}

// ---------------------------------------------------------------
// Connection
// ---------------------------------------------------------------

pub struct LoopbackConnection {
    id: ConnectionId,
    ready: watch::Sender<Readiness>,
    invalidated: watch::Sender<Option<ChannelError>>,
    channels: Mutex<Vec<Arc<LoopbackChannel>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<dyn Channel>>>>,
    request_error: Mutex<Option<ChannelError>>,
    requests_open: watch::Sender<bool>,
    next_channel: AtomicU32,
}

impl LoopbackConnection {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(id),
            ready: watch::channel(Readiness::Ready).0,
            invalidated: watch::channel(None).0,
            channels: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            request_error: Mutex::new(None),
            requests_open: watch::channel(true).0,
            next_channel: AtomicU32::new(1),
        })
    }

    pub fn defer_ready(&self) {
        self.ready.send_replace(Readiness::Waiting);
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(Readiness::Ready);
    }

    pub fn fail_ready(&self, error: ChannelError) {
        self.ready.send_replace(Readiness::Failed(error));
    }

    /// Add a channel that exists before anyone listens.
    pub fn add_existing(&self, channel: Arc<LoopbackChannel>) {
        self.channels.lock().push(channel);
    }

    /// Create a channel and notify live listeners.
    pub fn announce(&self, channel: Arc<LoopbackChannel>) {
        self.channels.lock().push(channel.clone());
        let channel: Arc<dyn Channel> = channel;
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(channel.clone()).is_ok());
    }

    pub fn channel(&self, object_path: &str) -> Option<Arc<LoopbackChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.object_path() == object_path)
            .cloned()
    }

    /// Make the next channel requests fail.
    pub fn fail_requests(&self, error: Option<ChannelError>) {
        *self.request_error.lock() = error;
    }

    /// Keep channel requests waiting until [`LoopbackConnection::release_requests`].
    pub fn hold_requests(&self) {
        self.requests_open.send_replace(false);
    }

    pub fn release_requests(&self) {
        self.requests_open.send_replace(true);
    }

    /// Disconnect: invalidates the connection and all of its channels.
    pub fn invalidate(&self, error: ChannelError) {
        if !invalidate_once(&self.invalidated, error.clone()) {
            return;
        }
        debug!("Loopback connection {} invalidated", self.id);
        let channels = self.channels.lock().clone();
        for channel in channels {
            channel.invalidate(error.clone());
        }
        self.subscribers.lock().clear();
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn become_ready(&self) -> Result<(), ChannelError> {
        Readiness::wait(&self.ready).await
    }

    fn new_channels(&self) -> ChannelStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        Box::pin(UnboundedReceiverStream::new(receiver))
    }

    async fn list_channels(&self) -> Result<Vec<Arc<dyn Channel>>, ChannelError> {
        let channels = self.channels.lock().clone();
        Ok(channels
            .into_iter()
            .filter(|channel| !channel.is_invalidated())
            .map(|channel| channel as Arc<dyn Channel>)
            .collect())
    }

    fn subscribe_invalidated(&self) -> watch::Receiver<Option<ChannelError>> {
        self.invalidated.subscribe()
    }

    /// Returns a live channel of the same kind and target if there is one.
    async fn request_channel(
        &self,
        kind: ChannelKind,
        target: TargetHandle,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let mut open = self.requests_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        if let Some(error) = self.request_error.lock().clone() {
            return Err(error);
        }
        if let Some(error) = self.invalidated.borrow().clone() {
            return Err(error);
        }

        let existing = self
            .channels
            .lock()
            .iter()
            .find(|channel| {
                channel.kind() == kind && channel.target() == target && !channel.is_invalidated()
            })
            .cloned();
        if let Some(channel) = existing {
            return Ok(channel);
        }

        let number = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let path = format!("/{}/{}/requested{}", self.id, kind_slug(kind), number);
        let channel = LoopbackChannel::outgoing(path, kind, target);
        self.announce(channel.clone());
        Ok(channel)
    }
}

// ---------------------------------------------------------------
// Typed wrappers
// ---------------------------------------------------------------

pub struct LoopbackChat {
    channel: Arc<dyn Channel>,
    conversation: watch::Sender<Option<String>>,
    messages: broadcast::Sender<ReceivedMessage>,
    pending: Mutex<Vec<ReceivedMessage>>,
}

impl LoopbackChat {
    /// Resolve the conversation identifier.
    pub fn resolve(&self, conversation_id: impl Into<String>) {
        self.conversation.send_replace(Some(conversation_id.into()));
    }

    /// Deliver a message from the remote side.
    pub fn receive(&self, message: ReceivedMessage) {
        self.pending.lock().push(message.clone());
        let _ = self.messages.send(message);
    }

    /// Mark every pending message as read.
    pub fn acknowledge(&self) {
        self.pending.lock().clear();
    }
}

#[async_trait]
impl ChatChannel for LoopbackChat {
    fn channel(&self) -> Arc<dyn Channel> {
        self.channel.clone()
    }

    fn conversation_id(&self) -> Option<String> {
        self.conversation.borrow().clone()
    }

    async fn wait_ready(&self) -> Result<(), ChannelError> {
        let mut receiver = self.conversation.subscribe();
        receiver
            .wait_for(Option::is_some)
            .await
            .map(|_| ())
            .map_err(|_| ChannelError::closed())
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.messages.subscribe()
    }

    fn pending_messages(&self) -> Vec<ReceivedMessage> {
        self.pending.lock().clone()
    }
}

pub struct LoopbackCall {
    channel: Arc<dyn Channel>,
    contact: watch::Sender<Option<Contact>>,
}

impl LoopbackCall {
    pub fn resolve_contact(&self, contact: Contact) {
        self.contact.send_replace(Some(contact));
    }
}

#[async_trait]
impl CallChannel for LoopbackCall {
    fn channel(&self) -> Arc<dyn Channel> {
        self.channel.clone()
    }

    fn remote_contact(&self) -> Option<Contact> {
        self.contact.borrow().clone()
    }

    async fn wait_contact(&self) -> Result<Contact, ChannelError> {
        let mut receiver = self.contact.subscribe();
        let contact = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ChannelError::closed())?;
        (*contact).clone().ok_or_else(ChannelError::closed)
    }
}

pub struct LoopbackFileTransfer {
    channel: Arc<dyn Channel>,
    offer: FileOffer,
}

impl FileTransferChannel for LoopbackFileTransfer {
    fn channel(&self) -> Arc<dyn Channel> {
        self.channel.clone()
    }

    fn offer(&self) -> FileOffer {
        self.offer.clone()
    }
}

/// Builds loopback wrappers and remembers them by channel path.
#[derive(Default)]
pub struct LoopbackWrapperFactory {
    defer_chat: bool,
    defer_call: bool,
    chats: Mutex<HashMap<String, Arc<LoopbackChat>>>,
    calls: Mutex<HashMap<String, Arc<LoopbackCall>>>,
}

impl LoopbackWrapperFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chats wait for [`LoopbackChat::resolve`].
    pub fn defer_chat_ready(mut self) -> Self {
        self.defer_chat = true;
        self
    }

    /// Calls wait for [`LoopbackCall::resolve_contact`].
    pub fn defer_call_contact(mut self) -> Self {
        self.defer_call = true;
        self
    }

    pub fn chat_for(&self, object_path: &str) -> Option<Arc<LoopbackChat>> {
        self.chats.lock().get(object_path).cloned()
    }

    pub fn call_for(&self, object_path: &str) -> Option<Arc<LoopbackCall>> {
        self.calls.lock().get(object_path).cloned()
    }
}

impl WrapperFactory for LoopbackWrapperFactory {
    fn chat(&self, channel: Arc<dyn Channel>) -> Arc<dyn ChatChannel> {
        let conversation = (!self.defer_chat).then(|| format!("conversation:{}", channel.object_path()));
        let chat = Arc::new(LoopbackChat {
            channel: channel.clone(),
            conversation: watch::channel(conversation).0,
            messages: broadcast::channel(EVENT_CAPACITY).0,
            pending: Mutex::new(Vec::new()),
        });
        self.chats
            .lock()
            .insert(channel.object_path().to_string(), chat.clone());
        chat
    }

    fn call(&self, channel: Arc<dyn Channel>) -> Arc<dyn CallChannel> {
        let target = channel.target();
        let contact = (!self.defer_call && target.is_contact())
            .then(|| Contact::new(format!("contact-{}", target.handle), target.handle));
        let call = Arc::new(LoopbackCall {
            channel: channel.clone(),
            contact: watch::channel(contact).0,
        });
        self.calls
            .lock()
            .insert(channel.object_path().to_string(), call.clone());
        call
    }

    fn file_transfer(&self, channel: Arc<dyn Channel>) -> Arc<dyn FileTransferChannel> {
        let filename = channel
            .object_path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Arc::new(LoopbackFileTransfer {
            channel,
            offer: FileOffer {
                filename,
                size: 0,
                content_type: None,
            },
        })
    }
}

// ---------------------------------------------------------------
// Contacts and tube handlers
// ---------------------------------------------------------------

/// Fixed handle-to-contact table shared by every connection.
#[derive(Default)]
pub struct StaticContacts {
    contacts: Mutex<HashMap<u32, Contact>>,
}

impl StaticContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(self, contact: Contact) -> Self {
        self.insert(contact);
        self
    }

    pub fn insert(&self, contact: Contact) {
        self.contacts.lock().insert(contact.handle, contact);
    }
}

#[async_trait]
impl ContactResolver for StaticContacts {
    async fn lookup(&self, _connection: &ConnectionId, handle: u32) -> Option<Contact> {
        self.contacts.lock().get(&handle).cloned()
    }
}

/// Tube handler directory with a fixed set of running and activatable names.
#[derive(Default)]
pub struct LoopbackTubeHandlers {
    running: Mutex<HashSet<String>>,
    activatable: Mutex<HashSet<String>>,
    handled: Mutex<Vec<(String, u32)>>,
    failing: Mutex<Option<ChannelError>>,
}

impl LoopbackTubeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running(self, bus_name: impl Into<String>) -> Self {
        self.running.lock().insert(bus_name.into());
        self
    }

    pub fn with_activatable(self, bus_name: impl Into<String>) -> Self {
        self.activatable.lock().insert(bus_name.into());
        self
    }

    /// Make every hand-off fail with `error`.
    pub fn fail_with(&self, error: ChannelError) {
        *self.failing.lock() = Some(error);
    }

    /// `(bus name, tube id)` of every tube handed off.
    pub fn handled(&self) -> Vec<(String, u32)> {
        self.handled.lock().clone()
    }
}

#[async_trait]
impl TubeHandlerDirectory for LoopbackTubeHandlers {
    async fn is_running(&self, bus_name: &str) -> bool {
        self.running.lock().contains(bus_name)
    }

    async fn activatable_names(&self) -> Result<Vec<String>, ChannelError> {
        let mut names: Vec<_> = self.activatable.lock().iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn handle_tube(&self, tube: &TubeDescriptor) -> Result<(), ChannelError> {
        if let Some(error) = self.failing.lock().clone() {
            return Err(error);
        }
        let known = self.running.lock().contains(&tube.bus_name)
            || self.activatable.lock().contains(&tube.bus_name);
        if !known {
            return Err(ChannelError::new(
                "org.freedesktop.DBus.Error.ServiceUnknown",
                0,
                format!("No handler for {}", tube.bus_name),
            ));
        }

        // Activation starts the handler.
        self.running.lock().insert(tube.bus_name.clone());
        self.handled
            .lock()
            .push((tube.bus_name.clone(), tube.tube_id));
        Ok(())
    }
}
