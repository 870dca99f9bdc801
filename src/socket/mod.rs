use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, warn};
use url::Url;

use crate::channel::{Channel, ChannelShared, ChannelStatus};
use crate::message::{Envelope, Vsn};
use crate::timer::{default_reconnect_after, default_rejoin_after, Backoff};
use crate::transport::{Transport, WebSocketTransport};

mod driver;

/// Connection state of a [`Socket`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketStatus {
    /// No transport, and none being established.
    Closed,
    /// A connection attempt (or an automatic reconnect) is in progress.
    Connecting,
    /// The transport is open.
    Open,
}

/// Handle returned by the socket's `on_open`/`on_close`/`on_error`
/// registrations, used to remove that callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSubscription {
    kind: HookKind,
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Open,
    Close,
    Error,
}

pub(crate) enum Command {
    Connect,
    Disconnect { code: u16, reason: String },
    Frame { topic: String, text: String },
}

type OpenFn = Arc<Mutex<dyn FnMut() + Send>>;
type CloseFn = Arc<Mutex<dyn FnMut(u16, &str) + Send>>;
type ErrorFn = Arc<Mutex<dyn FnMut(&str) + Send>>;

/// Configures and spawns a [`Socket`].
#[derive(Clone)]
pub struct SocketBuilder {
    endpoint: Url,
    timeout: Duration,
    heartbeat_interval: Duration,
    reconnect_after: Backoff,
    rejoin_after: Backoff,
    serializer: Vsn,
    params: Value,
    websocket_config: Option<WebSocketConfig>,
    push_buffer_max: usize,
}

impl SocketBuilder {
    /// A builder for the given endpoint with the default configuration.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(30_000),
            reconnect_after: Arc::new(default_reconnect_after),
            rejoin_after: Arc::new(default_rejoin_after),
            serializer: Vsn::default(),
            params: Value::Object(serde_json::Map::new()),
            websocket_config: None,
            push_buffer_max: 100,
        }
    }

    /// Default reply deadline for joins and pushes. Defaults to 10 s.
    pub fn timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Heartbeat period. Defaults to 30 s.
    pub fn heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    /// Schedule for reopening the transport, indexed by attempt (from 1).
    pub fn reconnect_after(&mut self, schedule: impl Fn(u32) -> Duration + Send + Sync + 'static) {
        self.reconnect_after = Arc::new(schedule);
    }

    /// Schedule for rejoining errored channels, indexed by attempt (from 1).
    pub fn rejoin_after(&mut self, schedule: impl Fn(u32) -> Duration + Send + Sync + 'static) {
        self.rejoin_after = Arc::new(schedule);
    }

    /// Wire serializer version. Defaults to [`Vsn::V2`].
    pub fn serializer(&mut self, serializer: Vsn) {
        self.serializer = serializer;
    }

    /// Connection params, announced as query parameters on the endpoint.
    pub fn params(&mut self, params: Value) {
        self.params = params;
    }

    /// Low-level websocket configuration.
    pub fn websocket_config(&mut self, websocket_config: Option<WebSocketConfig>) {
        self.websocket_config = websocket_config;
    }

    /// Per-channel cap on pushes buffered while not joined. Defaults to 100;
    /// overflowing drops the oldest buffered push.
    pub fn push_buffer_max(&mut self, max: usize) {
        self.push_buffer_max = max;
    }

    /// Spawn the socket over a websocket transport to the endpoint.
    ///
    /// Must be called within a tokio runtime. The socket stays disconnected
    /// until [`Socket::connect`] is called.
    pub fn build(&self) -> Socket {
        let transport = WebSocketTransport::new(
            self.endpoint.clone(),
            self.serializer,
            &self.params,
            self.websocket_config.clone(),
        );
        self.build_with(transport)
    }

    /// Spawn the socket over any [`Transport`], e.g. an in-memory one in
    /// tests.
    pub fn build_with<T: Transport>(&self, transport: T) -> Socket {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let shared = Arc::new(SocketShared {
            serializer: self.serializer,
            default_timeout: self.timeout,
            heartbeat_interval: self.heartbeat_interval,
            reconnect_after: Arc::clone(&self.reconnect_after),
            rejoin_after: Arc::clone(&self.rejoin_after),
            push_buffer_max: self.push_buffer_max,
            reference: AtomicU64::new(0),
            cmd_tx,
            state: Mutex::new(SocketState {
                status: SocketStatus::Closed,
                channels: Vec::new(),
                send_buffer: Vec::new(),
                pending_heartbeat_ref: None,
            }),
            callbacks: Mutex::new(SocketCallbacks::default()),
        });
        tokio::spawn(driver::run(transport, Arc::downgrade(&shared), cmd_rx));
        Socket { shared }
    }
}

/// A single multiplexed connection to a channels server.
///
/// The socket owns its channels and the transport; dropping the last clone of
/// this handle (and of every [`Channel`] created from it) stops the
/// background connection task.
#[derive(Clone)]
pub struct Socket {
    pub(crate) shared: Arc<SocketShared>,
}

impl Socket {
    /// A [`SocketBuilder`] for the given endpoint.
    pub fn builder(endpoint: Url) -> SocketBuilder {
        SocketBuilder::new(endpoint)
    }

    /// Open the transport, unless it is already open or opening.
    ///
    /// After a non-user-initiated close the socket reconnects on its own with
    /// backoff; `connect` only needs to be called once, and again after an
    /// explicit [`disconnect`](Socket::disconnect).
    pub fn connect(&self) {
        {
            let mut state = self.shared.state();
            if state.status != SocketStatus::Closed {
                return;
            }
            state.status = SocketStatus::Connecting;
        }
        let _ = self.shared.cmd_tx.send(Command::Connect);
    }

    /// Close the transport and suppress automatic reconnection.
    pub fn disconnect(&self, code: Option<u16>, reason: Option<&str>) {
        let _ = self.shared.cmd_tx.send(Command::Disconnect {
            code: code.unwrap_or(1000),
            reason: reason.unwrap_or_default().to_string(),
        });
    }

    /// Construct and register a channel for a topic.
    pub fn channel(&self, topic: impl Into<String>, params: Value) -> Channel {
        let channel = Channel::new(&self.shared, topic.into(), params);
        self.shared
            .state()
            .channels
            .push(Arc::clone(&channel.shared));
        channel
    }

    /// True while the transport is open.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// The current connection state.
    pub fn status(&self) -> SocketStatus {
        self.shared.state().status
    }

    /// Register a callback for transport open.
    pub fn on_open(&self, callback: impl FnMut() + Send + 'static) -> SocketSubscription {
        self.shared.on_open_internal(callback)
    }

    /// Register a callback for transport close, with the close code and
    /// reason.
    pub fn on_close(
        &self,
        callback: impl FnMut(u16, &str) + Send + 'static,
    ) -> SocketSubscription {
        self.shared.on_close_internal(callback)
    }

    /// Register a callback for transport errors.
    pub fn on_error(&self, callback: impl FnMut(&str) + Send + 'static) -> SocketSubscription {
        self.shared.on_error_internal(callback)
    }

    /// Remove a callback registered with `on_open`/`on_close`/`on_error`.
    pub fn off(&self, subscription: &SocketSubscription) {
        self.shared.off_internal(subscription);
    }
}

pub(crate) struct SocketShared {
    pub(crate) serializer: Vsn,
    pub(crate) default_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) reconnect_after: Backoff,
    pub(crate) rejoin_after: Backoff,
    pub(crate) push_buffer_max: usize,
    reference: AtomicU64,
    cmd_tx: UnboundedSender<Command>,
    state: Mutex<SocketState>,
    callbacks: Mutex<SocketCallbacks>,
}

struct SocketState {
    status: SocketStatus,
    channels: Vec<Arc<ChannelShared>>,
    /// Frames queued while disconnected, tagged with their topic so a
    /// channel that closes can withdraw what it queued.
    send_buffer: Vec<(String, String)>,
    pending_heartbeat_ref: Option<String>,
}

#[derive(Default)]
struct SocketCallbacks {
    next_id: u64,
    open: Vec<(u64, OpenFn)>,
    close: Vec<(u64, CloseFn)>,
    error: Vec<(u64, ErrorFn)>,
}

impl SocketShared {
    fn state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().expect("socket state poisoned")
    }

    fn callbacks(&self) -> MutexGuard<'_, SocketCallbacks> {
        self.callbacks.lock().expect("socket callbacks poisoned")
    }

    /// Next ref: a per-socket ascending counter rendered as a string,
    /// starting at `"1"`.
    pub(crate) fn make_ref(&self) -> String {
        (self.reference.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state().status == SocketStatus::Open
    }

    pub(crate) fn encode(&self, envelope: &Envelope) -> Option<String> {
        match self.serializer.encode(envelope) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!(error = %e, topic = %envelope.topic, "failed to encode envelope");
                None
            }
        }
    }

    /// Send an envelope if the transport is open, else queue it for the
    /// flush that follows the next successful connect.
    pub(crate) fn push_envelope(&self, envelope: Envelope) {
        let Some(frame) = self.encode(&envelope) else {
            return;
        };
        debug!(
            topic = %envelope.topic,
            event = %envelope.event,
            reference = ?envelope.reference,
            join_ref = ?envelope.join_ref,
            "push"
        );
        let mut state = self.state();
        if state.status == SocketStatus::Open {
            drop(state);
            let _ = self.cmd_tx.send(Command::Frame {
                topic: envelope.topic,
                text: frame,
            });
        } else {
            state.send_buffer.push((envelope.topic, frame));
        }
    }

    pub(crate) fn buffer_frame(&self, topic: String, frame: String) {
        self.state().send_buffer.push((topic, frame));
    }

    pub(crate) fn take_send_buffer(&self) -> Vec<String> {
        std::mem::take(&mut self.state().send_buffer)
            .into_iter()
            .map(|(_, frame)| frame)
            .collect()
    }

    /// Drop queued frames for a topic whose channel is done with them.
    pub(crate) fn purge_topic(&self, topic: &str) {
        self.state()
            .send_buffer
            .retain(|(buffered, _)| buffered != topic);
    }

    pub(crate) fn set_status(&self, status: SocketStatus) {
        self.state().status = status;
    }

    pub(crate) fn mark_open(&self) {
        let mut state = self.state();
        state.status = SocketStatus::Open;
        state.pending_heartbeat_ref = None;
    }

    pub(crate) fn heartbeat_outstanding(&self) -> bool {
        self.state().pending_heartbeat_ref.is_some()
    }

    pub(crate) fn begin_heartbeat(&self) -> String {
        let reference = self.make_ref();
        self.state().pending_heartbeat_ref = Some(reference.clone());
        reference
    }

    fn channels_snapshot(&self) -> Vec<Arc<ChannelShared>> {
        self.state().channels.clone()
    }

    /// Decode an inbound frame and deliver it to every member channel.
    pub(crate) fn route(&self, text: &str) {
        let envelope = match self.serializer.decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "failed to decode inbound frame");
                return;
            }
        };
        {
            let mut state = self.state();
            if state.pending_heartbeat_ref.is_some()
                && envelope.reference == state.pending_heartbeat_ref
            {
                state.pending_heartbeat_ref = None;
            }
        }
        debug!(
            topic = %envelope.topic,
            event = %envelope.event,
            reference = ?envelope.reference,
            "recv"
        );
        for channel in self.channels_snapshot() {
            if channel.is_member(&envelope) {
                channel.handle_inbound(envelope.clone());
            }
        }
    }

    /// Force-close any other registered channel on the same topic that is
    /// joined or joining, so a rejoin cannot leave a phantom membership.
    pub(crate) fn leave_open_topic(&self, joining: &Arc<ChannelShared>) {
        let duplicate = self.channels_snapshot().into_iter().find(|candidate| {
            !Arc::ptr_eq(candidate, joining)
                && candidate.topic() == joining.topic()
                && matches!(
                    candidate.status(),
                    ChannelStatus::Joined | ChannelStatus::Joining
                )
        });
        if let Some(duplicate) = duplicate {
            warn!(topic = %duplicate.topic(), "leaving duplicate topic");
            duplicate.evict();
        }
    }

    /// Mark every live channel errored after a transport close or error.
    pub(crate) fn trigger_chan_error(&self) {
        for channel in self.channels_snapshot() {
            match channel.status() {
                ChannelStatus::Errored | ChannelStatus::Leaving | ChannelStatus::Closed => {}
                _ => channel.handle_error(Value::Null),
            }
        }
    }

    pub(crate) fn on_open_internal(
        &self,
        callback: impl FnMut() + Send + 'static,
    ) -> SocketSubscription {
        let mut callbacks = self.callbacks();
        callbacks.next_id += 1;
        let id = callbacks.next_id;
        callbacks.open.push((id, Arc::new(Mutex::new(callback))));
        SocketSubscription {
            kind: HookKind::Open,
            id,
        }
    }

    pub(crate) fn on_close_internal(
        &self,
        callback: impl FnMut(u16, &str) + Send + 'static,
    ) -> SocketSubscription {
        let mut callbacks = self.callbacks();
        callbacks.next_id += 1;
        let id = callbacks.next_id;
        callbacks.close.push((id, Arc::new(Mutex::new(callback))));
        SocketSubscription {
            kind: HookKind::Close,
            id,
        }
    }

    pub(crate) fn on_error_internal(
        &self,
        callback: impl FnMut(&str) + Send + 'static,
    ) -> SocketSubscription {
        let mut callbacks = self.callbacks();
        callbacks.next_id += 1;
        let id = callbacks.next_id;
        callbacks.error.push((id, Arc::new(Mutex::new(callback))));
        SocketSubscription {
            kind: HookKind::Error,
            id,
        }
    }

    pub(crate) fn off_internal(&self, subscription: &SocketSubscription) {
        let mut callbacks = self.callbacks();
        match subscription.kind {
            HookKind::Open => callbacks.open.retain(|(id, _)| *id != subscription.id),
            HookKind::Close => callbacks.close.retain(|(id, _)| *id != subscription.id),
            HookKind::Error => callbacks.error.retain(|(id, _)| *id != subscription.id),
        }
    }

    pub(crate) fn fire_open(&self) {
        let snapshot: Vec<OpenFn> = self
            .callbacks()
            .open
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            (callback.lock().expect("socket open callback poisoned"))();
        }
    }

    pub(crate) fn fire_close(&self, code: u16, reason: &str) {
        let snapshot: Vec<CloseFn> = self
            .callbacks()
            .close
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            (callback.lock().expect("socket close callback poisoned"))(code, reason);
        }
    }

    pub(crate) fn fire_error(&self, reason: &str) {
        let snapshot: Vec<ErrorFn> = self
            .callbacks()
            .error
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            (callback.lock().expect("socket error callback poisoned"))(reason);
        }
    }
}
