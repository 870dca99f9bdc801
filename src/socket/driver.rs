//! The connection driver task.
//!
//! One spawned task per socket owns the transport and serializes connecting,
//! heartbeating, reconnect backoff and inbound routing. Commands from the
//! handles arrive over an unbounded mpsc; the task exits once every handle
//! (and with them the shared state) is gone.

use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Command, SocketShared, SocketStatus};
use crate::message::Envelope;
use crate::transport::{Transport, TransportEvent, TransportSink, TransportStream};

enum ConnOutcome {
    /// The application called `disconnect`; do not reconnect.
    User { code: u16, reason: String },
    /// The connection dropped out from under us; reconnect with backoff.
    Lost { code: u16, reason: String },
    /// The socket was dropped; stop the task.
    Shutdown,
}

pub(crate) async fn run<T: Transport>(
    mut transport: T,
    shared: Weak<SocketShared>,
    mut cmd_rx: UnboundedReceiver<Command>,
) {
    'idle: loop {
        // Parked until the application asks to connect.
        loop {
            match cmd_rx.recv().await {
                None => return,
                Some(Command::Connect) => break,
                Some(Command::Disconnect { .. }) => {}
                Some(Command::Frame { topic, text }) => {
                    if !rebuffer(&shared, topic, text) {
                        return;
                    }
                }
            }
        }

        let mut tries: u32 = 0;
        let mut wait_before_attempt = false;
        'session: loop {
            if wait_before_attempt {
                tries += 1;
                let delay = match shared.upgrade() {
                    Some(s) => (s.reconnect_after)(tries),
                    None => return,
                };
                debug!(tries, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                let sleep = time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = cmd_rx.recv() => match cmd {
                            None => return,
                            // An explicit connect retries without the wait.
                            Some(Command::Connect) => break,
                            Some(Command::Disconnect { .. }) => {
                                if let Some(s) = shared.upgrade() {
                                    s.set_status(SocketStatus::Closed);
                                }
                                continue 'idle;
                            }
                            Some(Command::Frame { topic, text }) => {
                                if !rebuffer(&shared, topic, text) {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            wait_before_attempt = true;

            let (mut sink, mut stream) = match transport.connect().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, tries, "websocket connect failed");
                    match shared.upgrade() {
                        Some(s) => s.fire_error(&e.to_string()),
                        None => return,
                    }
                    continue 'session;
                }
            };

            let heartbeat_interval = match shared.upgrade() {
                Some(s) => {
                    info!("websocket connected");
                    tries = 0;
                    s.mark_open();
                    for frame in s.take_send_buffer() {
                        if let Err(e) = sink.send(frame).await {
                            warn!(error = %e, "failed to flush buffered frame");
                        }
                    }
                    s.fire_open();
                    s.heartbeat_interval
                }
                None => return,
            };

            match drive(&mut sink, &mut stream, &shared, &mut cmd_rx, heartbeat_interval).await {
                ConnOutcome::Shutdown => return,
                ConnOutcome::User { code, reason } => {
                    let Some(s) = shared.upgrade() else { return };
                    info!(code, reason = %reason, "websocket disconnected");
                    s.set_status(SocketStatus::Closed);
                    s.fire_close(code, &reason);
                    s.trigger_chan_error();
                    continue 'idle;
                }
                ConnOutcome::Lost { code, reason } => {
                    let Some(s) = shared.upgrade() else { return };
                    warn!(code, reason = %reason, "websocket connection lost");
                    s.set_status(SocketStatus::Connecting);
                    s.fire_close(code, &reason);
                    s.trigger_chan_error();
                    continue 'session;
                }
            }
        }
    }
}

/// Serve one open connection until it ends, one way or another.
async fn drive<S: TransportSink, R: TransportStream>(
    sink: &mut S,
    stream: &mut R,
    shared: &Weak<SocketShared>,
    cmd_rx: &mut UnboundedReceiver<Command>,
    heartbeat_interval: Duration,
) -> ConnOutcome {
    let mut heartbeat = time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    sink.close(1000, "").await;
                    return ConnOutcome::Shutdown;
                }
                Some(Command::Frame { text, .. }) => {
                    if let Err(e) = sink.send(text).await {
                        return ConnOutcome::Lost { code: 1006, reason: e.to_string() };
                    }
                }
                Some(Command::Disconnect { code, reason }) => {
                    sink.close(code, &reason).await;
                    return ConnOutcome::User { code, reason };
                }
                Some(Command::Connect) => {}
            },

            _ = heartbeat.tick() => {
                let Some(s) = shared.upgrade() else { return ConnOutcome::Shutdown };
                if s.heartbeat_outstanding() {
                    // A half-open TCP connection never reports itself; the
                    // missed reply is the only liveness signal we get.
                    warn!("heartbeat reply not received, closing transport");
                    sink.close(1000, "heartbeat timeout").await;
                    return ConnOutcome::Lost { code: 1000, reason: "heartbeat timeout".to_string() };
                }
                let frame = s.encode(&Envelope::heartbeat(s.begin_heartbeat()));
                drop(s);
                if let Some(frame) = frame {
                    if let Err(e) = sink.send(frame).await {
                        return ConnOutcome::Lost { code: 1006, reason: e.to_string() };
                    }
                }
            },

            event = stream.next() => match event {
                Some(TransportEvent::Message(text)) => {
                    let Some(s) = shared.upgrade() else { return ConnOutcome::Shutdown };
                    s.route(&text);
                }
                Some(TransportEvent::Error(reason)) => {
                    if let Some(s) = shared.upgrade() {
                        s.fire_error(&reason);
                    }
                    return ConnOutcome::Lost { code: 1006, reason };
                }
                Some(TransportEvent::Closed { code, reason }) => {
                    return ConnOutcome::Lost { code, reason };
                }
                None => {
                    return ConnOutcome::Lost { code: 1006, reason: String::new() };
                }
            },
        }
    }
}

fn rebuffer(shared: &Weak<SocketShared>, topic: String, text: String) -> bool {
    match shared.upgrade() {
        Some(s) => {
            s.buffer_frame(topic, text);
            true
        }
        None => false,
    }
}
