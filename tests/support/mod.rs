//! In-memory transport for driving a socket from tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use url::Url;

use trellis::{
    Socket, SocketBuilder, Transport, TransportError, TransportEvent, TransportSink,
    TransportStream,
};

/// Scriptable [`Transport`]: the paired [`TransportCtl`] observes outbound
/// frames and injects server events.
pub struct FakeTransport {
    ctl: TransportCtl,
}

#[derive(Clone, Default)]
pub struct TransportCtl {
    inner: Arc<Mutex<CtlInner>>,
}

#[derive(Default)]
struct CtlInner {
    sent: Vec<String>,
    attempts: usize,
    connects: usize,
    fail_connects: usize,
    closes: Vec<(u16, String)>,
    event_tx: Option<UnboundedSender<TransportEvent>>,
}

impl FakeTransport {
    pub fn new() -> (FakeTransport, TransportCtl) {
        let ctl = TransportCtl::default();
        (FakeTransport { ctl: ctl.clone() }, ctl)
    }
}

impl TransportCtl {
    fn inner(&self) -> MutexGuard<'_, CtlInner> {
        self.inner.lock().expect("fake transport poisoned")
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner().fail_connects = n;
    }

    /// Connection attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.inner().attempts
    }

    /// Successful connections.
    pub fn connects(&self) -> usize {
        self.inner().connects
    }

    /// Every frame the client has sent, as parsed JSON.
    pub fn sent(&self) -> Vec<Value> {
        self.inner()
            .sent
            .iter()
            .map(|text| serde_json::from_str(text).expect("client sent invalid JSON"))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner().sent.clear();
    }

    /// `(code, reason)` of every close the client initiated.
    pub fn closes(&self) -> Vec<(u16, String)> {
        self.inner().closes.clone()
    }

    /// Inject a raw transport event into the current connection.
    pub fn server_send(&self, event: TransportEvent) {
        let tx = self
            .inner()
            .event_tx
            .clone()
            .expect("no open fake connection");
        let _ = tx.send(event);
    }

    /// Inject a v2 frame from the server.
    pub fn server_frame(
        &self,
        join_ref: Option<&str>,
        reference: Option<&str>,
        topic: &str,
        event: &str,
        payload: Value,
    ) {
        let frame = json!([join_ref, reference, topic, event, payload]).to_string();
        self.server_send(TransportEvent::Message(frame));
    }

    /// Inject a `phx_reply` from the server.
    pub fn server_reply(
        &self,
        join_ref: Option<&str>,
        reference: &str,
        topic: &str,
        status: &str,
        response: Value,
    ) {
        self.server_frame(
            join_ref,
            Some(reference),
            topic,
            "phx_reply",
            json!({"status": status, "response": response}),
        );
    }

    /// Close the current connection from the server side.
    pub fn server_close(&self, code: u16, reason: &str) {
        self.server_send(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Sink = FakeSink;
    type Stream = FakeStream;

    async fn connect(&mut self) -> Result<(FakeSink, FakeStream), TransportError> {
        let mut inner = self.ctl.inner();
        inner.attempts += 1;
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        inner.connects += 1;
        let (tx, rx) = unbounded_channel();
        inner.event_tx = Some(tx);
        Ok((
            FakeSink {
                ctl: self.ctl.clone(),
            },
            FakeStream { rx },
        ))
    }
}

pub struct FakeSink {
    ctl: TransportCtl,
}

#[async_trait]
impl TransportSink for FakeSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.ctl.inner().sent.push(text);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.ctl.inner().closes.push((code, reason.to_string()));
    }
}

pub struct FakeStream {
    rx: UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportStream for FakeStream {
    async fn next(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Build a socket over a fake transport.
pub fn build_socket() -> (Socket, TransportCtl) {
    build_socket_with(|_| {})
}

/// Build a socket over a fake transport, tweaking the builder first.
pub fn build_socket_with(configure: impl FnOnce(&mut SocketBuilder)) -> (Socket, TransportCtl) {
    let (transport, ctl) = FakeTransport::new();
    let endpoint = Url::parse("ws://localhost:4000/socket/websocket").expect("valid url");
    let mut builder = Socket::builder(endpoint);
    configure(&mut builder);
    (builder.build_with(transport), ctl)
}

/// Let the driver task and any due timers run (paused-clock runtimes advance
/// virtual time once everything is idle).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
