use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::message::event::{Event, ProtocolEvent};
use crate::message::{Envelope, PushStatus};
use crate::push::{Push, PushPayload};
use crate::socket::{SocketShared, SocketSubscription};
use crate::timer::RetryTimer;

/// A message delivered to channel subscribers.
#[derive(Debug, Clone)]
pub struct Message {
    /// The topic of the channel that received the message.
    pub topic: String,
    /// The event name.
    pub event: Event,
    /// The payload, after the channel's on-message hook ran.
    pub payload: Value,
    /// The ref correlating this message with a push, if any.
    pub reference: Option<String>,
    /// The join incarnation this message belongs to.
    pub join_ref: Option<String>,
}

/// Membership state of a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Not joined; a closed channel stays registered but will not rejoin.
    Closed,
    /// The membership was lost; a rejoin is pending.
    Errored,
    /// The server acknowledged the most recent join.
    Joined,
    /// A join is in flight.
    Joining,
    /// A leave is in flight.
    Leaving,
}

/// Handle returned by [`Channel::on`], used to remove that subscription.
///
/// Removal is by handle identity, so multiple subscriptions to the same event
/// can be removed independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    event: Event,
    id: u64,
}

impl Subscription {
    /// The event this subscription listens for.
    pub fn event(&self) -> &Event {
        &self.event
    }
}

type BindingFn = Arc<Mutex<dyn FnMut(&Message) + Send>>;
type OnMessageHook = Box<dyn FnMut(&Event, Value, Option<&str>) -> Value + Send>;

struct Binding {
    id: u64,
    event: Event,
    callback: BindingFn,
}

#[derive(Default)]
struct Bindings {
    next_id: u64,
    items: Vec<Binding>,
}

/// A per-topic channel multiplexed over a [`Socket`](crate::socket::Socket).
///
/// Created with [`Socket::channel`](crate::socket::Socket::channel). A channel
/// is joined once; after that it rejoins on its own with backoff whenever the
/// membership is lost, and pushes made while not joined are buffered and
/// flushed in order on the next successful join.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
}

pub(crate) struct ChannelShared {
    topic: String,
    socket: Weak<SocketShared>,
    params: Mutex<Value>,
    state: Mutex<ChannelState>,
    bindings: Mutex<Bindings>,
    on_message: Mutex<OnMessageHook>,
    join_push: Push,
    rejoin_timer: RetryTimer,
}

struct ChannelState {
    status: ChannelStatus,
    joined_once: bool,
    timeout: Duration,
    push_buffer: Vec<Push>,
    socket_hooks: Vec<SocketSubscription>,
}

impl Channel {
    pub(crate) fn new(socket: &Arc<SocketShared>, topic: String, params: Value) -> Channel {
        let timeout = socket.default_timeout;
        let rejoin_after = Arc::clone(&socket.rejoin_after);
        let shared = Arc::new_cyclic(|weak: &Weak<ChannelShared>| {
            let join_push = Push::from_weak(
                weak.clone(),
                Event::Protocol(ProtocolEvent::Join),
                PushPayload::JoinParams,
                timeout,
            );
            let rejoin_weak = weak.clone();
            ChannelShared {
                topic,
                socket: Arc::downgrade(socket),
                params: Mutex::new(params),
                state: Mutex::new(ChannelState {
                    status: ChannelStatus::Closed,
                    joined_once: false,
                    timeout,
                    push_buffer: Vec::new(),
                    socket_hooks: Vec::new(),
                }),
                bindings: Mutex::new(Bindings::default()),
                on_message: Mutex::new(Box::new(|_event, payload, _reference| payload)),
                join_push,
                rejoin_timer: RetryTimer::new(
                    Arc::new(move || {
                        if let Some(chan) = rejoin_weak.upgrade() {
                            if chan.socket_connected() {
                                ChannelShared::rejoin(&chan, None);
                            }
                        }
                    }),
                    rejoin_after,
                ),
            }
        });
        ChannelShared::install(&shared, socket);
        Channel { shared }
    }

    /// The topic this channel is bound to.
    pub fn topic(&self) -> &str {
        self.shared.topic()
    }

    /// The current membership state.
    pub fn status(&self) -> ChannelStatus {
        self.shared.status()
    }

    /// True once the server has acknowledged the most recent join.
    pub fn is_joined(&self) -> bool {
        self.status() == ChannelStatus::Joined
    }

    /// The ref of the push that joined the current incarnation.
    pub fn join_ref(&self) -> Option<String> {
        self.shared.join_ref()
    }

    /// Join the channel, sending the channel's params to the server.
    ///
    /// Returns the join push so receivers can be attached to the server's
    /// verdict. A channel can only be joined once; losing the membership
    /// later triggers automatic rejoins, not a new `join` call.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyJoined`] on a second call.
    pub fn join(&self) -> Result<Push, Error> {
        let timeout = self.shared.timeout();
        self.join_with_timeout(timeout)
    }

    /// [`join`](Channel::join) with an explicit reply deadline, which also
    /// becomes the channel's default push timeout.
    pub fn join_with_timeout(&self, timeout: Duration) -> Result<Push, Error> {
        {
            let mut state = self.shared.state();
            if state.joined_once {
                return Err(Error::AlreadyJoined);
            }
            state.joined_once = true;
            state.timeout = timeout;
        }
        ChannelShared::rejoin(&self.shared, Some(timeout));
        Ok(self.shared.join_push.clone())
    }

    /// Push an event to the server.
    ///
    /// While the channel is not joined (or the socket is down) the push is
    /// buffered with its timeout running and goes out, in order, when the
    /// channel next reaches [`ChannelStatus::Joined`].
    ///
    /// # Errors
    ///
    /// [`Error::NotJoined`] before the first [`join`](Channel::join);
    /// [`Error::Serde`] if the payload cannot be serialized.
    pub fn push(&self, event: impl Into<Event>, payload: impl Serialize) -> Result<Push, Error> {
        let timeout = self.shared.timeout();
        self.push_with_timeout(event, payload, timeout)
    }

    /// [`push`](Channel::push) with an explicit reply deadline.
    pub fn push_with_timeout(
        &self,
        event: impl Into<Event>,
        payload: impl Serialize,
        timeout: Duration,
    ) -> Result<Push, Error> {
        let payload = serde_json::to_value(payload)?;
        if !self.shared.state().joined_once {
            return Err(Error::NotJoined);
        }
        let push = Push::new(
            &self.shared,
            event.into(),
            PushPayload::Value(payload),
            timeout,
        );
        if self.shared.can_push() {
            push.send();
        } else {
            push.start_timeout();
            self.shared.buffer(push.clone());
        }
        Ok(push)
    }

    /// Leave the channel.
    ///
    /// Sends `phx_leave` and transitions to Closed on the server's ok (or
    /// locally on timeout). No further events are delivered after that.
    pub fn leave(&self) -> Push {
        let timeout = self.shared.timeout();
        self.leave_with_timeout(timeout)
    }

    /// [`leave`](Channel::leave) with an explicit reply deadline.
    pub fn leave_with_timeout(&self, timeout: Duration) -> Push {
        let shared = &self.shared;
        shared.rejoin_timer.reset();
        shared.join_push.cancel_timeout();
        // Checked before the Leaving transition, which makes can_push false.
        let deliverable = shared.can_push();
        shared.set_status(ChannelStatus::Leaving);
        debug!(topic = %shared.topic, "leaving channel");

        let leave = Push::new(
            shared,
            Event::Protocol(ProtocolEvent::Leave),
            PushPayload::Value(json!({})),
            timeout,
        );
        let weak = Arc::downgrade(shared);
        leave.receive(PushStatus::Ok, move |_reply| {
            if let Some(chan) = weak.upgrade() {
                chan.local_close("leave");
            }
        });
        let weak = Arc::downgrade(shared);
        leave.receive(PushStatus::Timeout, move |_reply| {
            if let Some(chan) = weak.upgrade() {
                chan.local_close("leave timeout");
            }
        });
        if deliverable {
            leave.send();
        } else {
            // No live membership to tear down server-side: close out locally
            // without queueing a frame for a topic that is already done.
            leave.trigger(PushStatus::Ok, json!({}));
        }
        leave
    }

    /// Subscribe to an event. Subscribers for one event fire in registration
    /// order; the returned handle removes exactly this subscription.
    pub fn on(
        &self,
        event: impl Into<Event>,
        callback: impl FnMut(&Message) + Send + 'static,
    ) -> Subscription {
        self.shared.on_internal(event.into(), callback)
    }

    /// Remove one subscription by handle.
    pub fn off(&self, subscription: &Subscription) {
        self.shared.off(subscription);
    }

    /// Remove every subscription for an event.
    pub fn off_event(&self, event: impl Into<Event>) {
        let event = event.into();
        self.shared
            .bindings()
            .items
            .retain(|binding| binding.event != event);
    }

    /// Replace the hook that runs on every inbound message before fan-out.
    ///
    /// The hook receives the event, the payload and the ref, and must return
    /// the payload (modified or not). Returning `Value::Null` for a non-null
    /// inbound payload is a contract violation and panics.
    pub fn on_message(
        &self,
        hook: impl FnMut(&Event, Value, Option<&str>) -> Value + Send + 'static,
    ) {
        *self
            .shared
            .on_message
            .lock()
            .expect("on_message hook poisoned") = Box::new(hook);
    }
}

impl ChannelShared {
    /// Lifecycle receivers on the join push plus the socket hooks. Split out
    /// of `new` because they need the finished `Arc`.
    fn install(shared: &Arc<ChannelShared>, socket: &Arc<SocketShared>) {
        let weak = Arc::downgrade(shared);
        shared.join_push.receive(PushStatus::Ok, move |_reply| {
            if let Some(chan) = weak.upgrade() {
                chan.on_join_ok();
            }
        });
        let weak = Arc::downgrade(shared);
        shared.join_push.receive(PushStatus::Error, move |reply| {
            if let Some(chan) = weak.upgrade() {
                chan.on_join_error(reply);
            }
        });
        let weak = Arc::downgrade(shared);
        shared.join_push.receive(PushStatus::Timeout, move |_reply| {
            if let Some(chan) = weak.upgrade() {
                ChannelShared::on_join_timeout(&chan);
            }
        });

        let weak = Arc::downgrade(shared);
        let open_hook = socket.on_open_internal(move || {
            if let Some(chan) = weak.upgrade() {
                ChannelShared::on_socket_open(&chan);
            }
        });
        let weak = Arc::downgrade(shared);
        let error_hook = socket.on_error_internal(move |_reason| {
            if let Some(chan) = weak.upgrade() {
                chan.rejoin_timer.reset();
            }
        });
        shared.state().socket_hooks = vec![open_hook, error_hook];
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel state poisoned")
    }

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        self.bindings.lock().expect("channel bindings poisoned")
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        self.state().status
    }

    fn set_status(&self, status: ChannelStatus) {
        self.state().status = status;
    }

    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    pub(crate) fn params(&self) -> Value {
        self.params.lock().expect("channel params poisoned").clone()
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push.reference()
    }

    fn socket(&self) -> Option<Arc<SocketShared>> {
        self.socket.upgrade()
    }

    pub(crate) fn socket_connected(&self) -> bool {
        self.socket().map(|s| s.is_connected()).unwrap_or(false)
    }

    fn can_push(&self) -> bool {
        self.socket_connected() && self.status() == ChannelStatus::Joined
    }

    pub(crate) fn socket_push(&self, envelope: Envelope) {
        match self.socket() {
            Some(socket) => socket.push_envelope(envelope),
            None => warn!(topic = %self.topic, "socket gone, dropping outbound message"),
        }
    }

    pub(crate) fn socket_make_ref(&self) -> Option<String> {
        self.socket().map(|s| s.make_ref())
    }

    fn buffer(&self, push: Push) {
        let max = self.socket().map(|s| s.push_buffer_max).unwrap_or(usize::MAX);
        let mut state = self.state();
        state.push_buffer.push(push);
        if state.push_buffer.len() > max {
            state.push_buffer.remove(0);
            warn!(topic = %self.topic, "push buffer full, dropping oldest buffered push");
        }
    }

    pub(crate) fn on_internal(
        &self,
        event: Event,
        callback: impl FnMut(&Message) + Send + 'static,
    ) -> Subscription {
        let mut bindings = self.bindings();
        bindings.next_id += 1;
        let id = bindings.next_id;
        bindings.items.push(Binding {
            id,
            event: event.clone(),
            callback: Arc::new(Mutex::new(callback)),
        });
        Subscription { event, id }
    }

    pub(crate) fn off(&self, subscription: &Subscription) {
        self.bindings()
            .items
            .retain(|binding| binding.id != subscription.id);
    }

    /// Does an inbound envelope belong to this channel's current incarnation?
    pub(crate) fn is_member(&self, envelope: &Envelope) -> bool {
        if envelope.topic != self.topic {
            return false;
        }
        if let Some(join_ref) = &envelope.join_ref {
            let current = self.join_ref();
            if current.as_deref() != Some(join_ref.as_str()) {
                info!(
                    topic = %self.topic,
                    event = %envelope.event,
                    join_ref = %join_ref,
                    current = ?current,
                    "dropping message from a previous channel incarnation"
                );
                return false;
            }
        }
        true
    }

    /// Route one inbound envelope through the state machine and the bindings.
    pub(crate) fn handle_inbound(&self, envelope: Envelope) {
        match envelope.event {
            Event::Protocol(ProtocolEvent::Reply) => {
                if let Some(reference) = envelope.reference.clone() {
                    self.dispatch(
                        Event::reply_for(&reference),
                        envelope.payload,
                        envelope.reference,
                        envelope.join_ref,
                    );
                }
            }
            Event::Protocol(ProtocolEvent::Close) => {
                self.dispatch(
                    Event::Protocol(ProtocolEvent::Close),
                    envelope.payload,
                    envelope.reference,
                    envelope.join_ref,
                );
                self.close("remote close");
            }
            Event::Protocol(ProtocolEvent::Error) => {
                self.handle_error(envelope.payload);
            }
            event => self.dispatch(event, envelope.payload, envelope.reference, envelope.join_ref),
        }
    }

    /// `phx_error`, from the wire or synthesized on transport loss.
    pub(crate) fn handle_error(&self, reason: Value) {
        let status = self.status();
        if status != ChannelStatus::Leaving && status != ChannelStatus::Closed {
            warn!(topic = %self.topic, status = ?status, "channel errored");
            if status == ChannelStatus::Joining {
                self.join_push.reset();
            }
            self.set_status(ChannelStatus::Errored);
            if self.socket_connected() {
                self.rejoin_timer.schedule_timeout();
            }
        }
        self.dispatch(Event::Protocol(ProtocolEvent::Error), reason, None, None);
    }

    /// Run the on-message hook, then fan out to subscribers in registration
    /// order. Callbacks run without any channel lock held.
    fn dispatch(
        &self,
        event: Event,
        payload: Value,
        reference: Option<String>,
        join_ref: Option<String>,
    ) {
        let inbound_null = payload.is_null();
        let handled = {
            let mut hook = self.on_message.lock().expect("on_message hook poisoned");
            (hook)(&event, payload, reference.as_deref())
        };
        if handled.is_null() && !inbound_null {
            panic!("on_message hook must return the payload, modified or unmodified");
        }

        let callbacks: Vec<BindingFn> = {
            let bindings = self.bindings();
            bindings
                .items
                .iter()
                .filter(|binding| binding.event == event)
                .map(|binding| Arc::clone(&binding.callback))
                .collect()
        };
        if callbacks.is_empty() {
            return;
        }
        let message = Message {
            topic: self.topic.clone(),
            event,
            payload: handled,
            reference,
            join_ref: join_ref.or_else(|| self.join_ref()),
        };
        for callback in callbacks {
            (callback.lock().expect("channel subscriber poisoned"))(&message);
        }
    }

    fn on_join_ok(&self) {
        debug!(topic = %self.topic, join_ref = ?self.join_ref(), "channel joined");
        let drained: Vec<Push> = {
            let mut state = self.state();
            state.status = ChannelStatus::Joined;
            std::mem::take(&mut state.push_buffer)
        };
        self.rejoin_timer.reset();
        for push in drained {
            push.send();
        }
    }

    fn on_join_error(&self, reply: &Value) {
        warn!(topic = %self.topic, reply = %reply, "server rejected join");
        self.set_status(ChannelStatus::Errored);
        if self.socket_connected() {
            self.rejoin_timer.schedule_timeout();
        }
    }

    fn on_join_timeout(this: &Arc<ChannelShared>) {
        warn!(topic = %this.topic, join_ref = ?this.join_ref(), "timed out joining channel");
        // Best effort, so the server does not keep a phantom membership from
        // a join frame that eventually arrives.
        let leave = Push::new(
            this,
            Event::Protocol(ProtocolEvent::Leave),
            PushPayload::Value(json!({})),
            this.timeout(),
        );
        leave.send();
        this.set_status(ChannelStatus::Errored);
        this.join_push.reset();
        if this.socket_connected() {
            this.rejoin_timer.schedule_timeout();
        }
    }

    fn on_socket_open(this: &Arc<ChannelShared>) {
        this.rejoin_timer.reset();
        if this.status() == ChannelStatus::Errored {
            debug!(topic = %this.topic, "socket reopened, rejoining");
            ChannelShared::rejoin(this, None);
        }
    }

    /// Start a fresh join attempt (a fresh incarnation).
    pub(crate) fn rejoin(this: &Arc<ChannelShared>, timeout: Option<Duration>) {
        if this.status() == ChannelStatus::Leaving {
            return;
        }
        if let Some(socket) = this.socket() {
            socket.leave_open_topic(this);
        }
        this.set_status(ChannelStatus::Joining);
        let timeout = timeout.unwrap_or_else(|| this.timeout());
        this.join_push.resend(timeout);
    }

    fn local_close(&self, reason: &str) {
        self.dispatch(
            Event::Protocol(ProtocolEvent::Close),
            Value::String(reason.to_string()),
            None,
            None,
        );
        self.close(reason);
    }

    /// The Closed transition. Idempotent: a server `phx_close` racing the
    /// local close from `leave` finds the work already done.
    pub(crate) fn close(&self, reason: &str) {
        {
            let mut state = self.state();
            if state.status == ChannelStatus::Closed {
                return;
            }
            state.status = ChannelStatus::Closed;
        }
        debug!(topic = %self.topic, reason, "channel closed");
        self.rejoin_timer.reset();
        self.join_push.cancel_timeout();
        let hooks = std::mem::take(&mut self.state().socket_hooks);
        if let Some(socket) = self.socket() {
            for hook in &hooks {
                socket.off_internal(hook);
            }
            // Nothing queued for this topic may go out after the close.
            socket.purge_topic(&self.topic);
        }
        // Closed severs the event graph: no binding outlives the membership.
        self.bindings().items.clear();
    }

    /// Local Closed transition for a duplicate-topic eviction.
    pub(crate) fn evict(&self) {
        self.local_close("duplicate topic");
    }
}
