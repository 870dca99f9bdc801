use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::channel::{ChannelShared, Subscription};
use crate::message::event::{Event, ProtocolEvent};
use crate::message::{reply_status, Envelope, PushStatus};

type ReceiverFn = Arc<Mutex<dyn FnMut(&Value) + Send>>;

/// One outbound request tracked for reply correlation and timeout.
///
/// Returned by [`Channel::join`](crate::channel::Channel::join),
/// [`Channel::push`](crate::channel::Channel::push) and
/// [`Channel::leave`](crate::channel::Channel::leave). Attach receivers with
/// [`receive`](Push::receive); they fire with the whole reply payload
/// (`{"status": .., "response": ..}`) when a reply with a matching status
/// arrives, or immediately if one already has.
#[derive(Clone)]
pub struct Push {
    pub(crate) shared: Arc<PushShared>,
}

/// Where a push's payload comes from when the envelope is built.
pub(crate) enum PushPayload {
    /// A payload fixed at construction.
    Value(Value),
    /// The channel's join params, re-read on every (re)send.
    JoinParams,
}

pub(crate) struct PushShared {
    channel: Weak<ChannelShared>,
    event: Event,
    payload: PushPayload,
    state: Mutex<PushState>,
}

struct PushState {
    timeout: Duration,
    reference: Option<String>,
    received: Option<Value>,
    sent: bool,
    receivers: Vec<(PushStatus, ReceiverFn)>,
    timeout_timer: Option<JoinHandle<()>>,
    reply_binding: Option<Subscription>,
}

impl Push {
    pub(crate) fn new(
        channel: &Arc<ChannelShared>,
        event: Event,
        payload: PushPayload,
        timeout: Duration,
    ) -> Push {
        Push::from_weak(Arc::downgrade(channel), event, payload, timeout)
    }

    pub(crate) fn from_weak(
        channel: Weak<ChannelShared>,
        event: Event,
        payload: PushPayload,
        timeout: Duration,
    ) -> Push {
        Push {
            shared: Arc::new(PushShared {
                channel,
                event,
                payload,
                state: Mutex::new(PushState {
                    timeout,
                    reference: None,
                    received: None,
                    sent: false,
                    receivers: Vec::new(),
                    timeout_timer: None,
                    reply_binding: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PushState> {
        self.shared.state.lock().expect("push state poisoned")
    }

    /// Register a callback for replies with the given status.
    ///
    /// If a matching reply has already arrived the callback fires
    /// immediately; either way it stays registered and fires again on any
    /// later matching reply (e.g. after a [`resend`](Push::resend)).
    pub fn receive(
        &self,
        status: impl Into<PushStatus>,
        callback: impl FnMut(&Value) + Send + 'static,
    ) -> &Self {
        let status = status.into();
        let callback: ReceiverFn = Arc::new(Mutex::new(callback));
        let immediate = {
            let mut state = self.state();
            let matched = state
                .received
                .as_ref()
                .filter(|reply| reply_status(reply).as_ref() == Some(&status))
                .cloned();
            state.receivers.push((status, Arc::clone(&callback)));
            matched
        };
        if let Some(reply) = immediate {
            (callback.lock().expect("push receiver poisoned"))(&reply);
        }
        self
    }

    /// The ref assigned on the most recent send, if any.
    pub fn reference(&self) -> Option<String> {
        self.state().reference.clone()
    }

    /// Cancel the pending reply timeout without sending anything.
    pub fn cancel_timeout(&self) {
        if let Some(timer) = self.state().timeout_timer.take() {
            timer.abort();
        }
    }

    /// Re-send this push: the pending timeout is cancelled, the previous ref
    /// and reply are discarded, and the push goes out with a fresh ref.
    pub fn resend(&self, timeout: Duration) {
        self.reset();
        self.state().timeout = timeout;
        self.send();
    }

    pub(crate) fn has_received(&self, status: &PushStatus) -> bool {
        self.state()
            .received
            .as_ref()
            .map(|reply| reply_status(reply).as_ref() == Some(status))
            .unwrap_or(false)
    }

    /// Whether this push has gone out on the current incarnation (a buffered
    /// push has not; a resend clears and re-sets this).
    pub fn sent(&self) -> bool {
        self.state().sent
    }

    /// Send the push through the socket, arming a fresh ref and timeout.
    ///
    /// A push that has already timed out locally is stale — its ref no longer
    /// correlates with any future reply — and is not re-sent.
    pub(crate) fn send(&self) {
        if self.has_received(&PushStatus::Timeout) {
            return;
        }
        let Some(channel) = self.shared.channel.upgrade() else {
            return;
        };
        self.start_timeout();
        let reference = {
            let mut state = self.state();
            state.sent = true;
            state.reference.clone()
        };
        let Some(reference) = reference else {
            // No ref could be assigned (socket gone); nothing to send.
            return;
        };
        // The join frame opens an incarnation, so it carries no join_ref of
        // its own; every other frame is stamped with the current one.
        let join_ref = if self.shared.event == Event::Protocol(ProtocolEvent::Join) {
            None
        } else {
            channel.join_ref()
        };
        let payload = match &self.shared.payload {
            PushPayload::Value(value) => value.clone(),
            PushPayload::JoinParams => channel.params(),
        };
        channel.socket_push(Envelope {
            join_ref,
            reference: Some(reference),
            topic: channel.topic().to_string(),
            event: self.shared.event.clone(),
            payload,
        });
    }

    /// Assign a fresh ref, rebind the reply listener and arm the timeout.
    pub(crate) fn start_timeout(&self) {
        let Some(channel) = self.shared.channel.upgrade() else {
            return;
        };
        let (old_timer, old_binding) = {
            let mut state = self.state();
            (state.timeout_timer.take(), state.reply_binding.take())
        };
        if let Some(timer) = old_timer {
            timer.abort();
        }
        if let Some(binding) = old_binding {
            channel.off(&binding);
        }

        let Some(reference) = channel.socket_make_ref() else {
            warn!(topic = %channel.topic(), event = %self.shared.event, "socket gone, push not sent");
            return;
        };
        // The binding and the timer each hold the push alive, so receivers
        // keep working after the caller drops its handle.
        let reply_event = Event::reply_for(&reference);
        let on_reply = Arc::clone(&self.shared);
        let binding = channel.on_internal(reply_event, move |message| {
            Push {
                shared: Arc::clone(&on_reply),
            }
            .handle_reply(&message.payload);
        });

        let timeout = {
            let mut state = self.state();
            state.reference = Some(reference);
            state.reply_binding = Some(binding);
            state.timeout
        };
        let on_deadline = Arc::clone(&self.shared);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            Push { shared: on_deadline }.trigger(PushStatus::Timeout, json!({}));
        });
        self.state().timeout_timer = Some(timer);
    }

    /// Forget the current incarnation of this push: pending timeout, ref,
    /// reply listener and recorded reply. Receivers stay registered.
    pub(crate) fn reset(&self) {
        let (timer, binding) = {
            let mut state = self.state();
            state.reference = None;
            state.received = None;
            state.sent = false;
            (state.timeout_timer.take(), state.reply_binding.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(binding) = binding {
            if let Some(channel) = self.shared.channel.upgrade() {
                channel.off(&binding);
            }
        }
    }

    /// Synthesize a local reply, e.g. `"timeout"` when the deadline passes.
    pub(crate) fn trigger(&self, status: PushStatus, response: Value) {
        self.handle_reply(&json!({
            "status": status.to_string(),
            "response": response,
        }));
    }

    /// Record an arriving reply, drop the reply listener and fan out to
    /// matching receivers.
    ///
    /// A ref correlates at most one reply, so the `chan_reply_<ref>` binding
    /// is removed here; late receivers are served from the recorded reply.
    pub(crate) fn handle_reply(&self, payload: &Value) {
        self.cancel_timeout();
        let (to_fire, binding) = {
            let mut state = self.state();
            state.received = Some(payload.clone());
            let status = reply_status(payload);
            let to_fire: Vec<ReceiverFn> = state
                .receivers
                .iter()
                .filter(|(expected, _)| status.as_ref() == Some(expected))
                .map(|(_, callback)| Arc::clone(callback))
                .collect();
            (to_fire, state.reply_binding.take())
        };
        if let Some(binding) = binding {
            if let Some(channel) = self.shared.channel.upgrade() {
                channel.off(&binding);
            }
        }
        for callback in to_fire {
            (callback.lock().expect("push receiver poisoned"))(payload);
        }
    }
}

impl Drop for PushShared {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(timer) = state.timeout_timer.take() {
                timer.abort();
            }
        }
    }
}
