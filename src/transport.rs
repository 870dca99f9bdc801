use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::message::Vsn;

type TungsteniteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors reported by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection attempt failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Sending a frame failed.
    #[error("send failed: {0}")]
    Send(String),
}

/// An event observed on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// The connection failed.
    Error(String),
    /// The connection was closed.
    Closed {
        /// Close code (1005 when the peer sent no close frame).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// The capability the socket drives its traffic through.
///
/// Each successful [`connect`](Transport::connect) yields the two halves of
/// one connection. The socket assumes frames are neither reordered nor
/// duplicated within a connection.
#[async_trait]
pub trait Transport: Send + 'static {
    /// The outbound half of a connection.
    type Sink: TransportSink;
    /// The inbound half of a connection.
    type Stream: TransportStream;

    /// Open a new connection.
    async fn connect(&mut self) -> Result<(Self::Sink, Self::Stream), TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait TransportSink: Send + 'static {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection, best effort.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Inbound half of a connection.
#[async_trait]
pub trait TransportStream: Send + 'static {
    /// The next event, or `None` once the connection is gone.
    async fn next(&mut self) -> Option<TransportEvent>;
}

/// [`Transport`] over a `tokio-tungstenite` websocket.
///
/// The serializer version and connection params are announced as query
/// parameters on the endpoint URL.
pub struct WebSocketTransport {
    endpoint: Url,
    websocket_config: Option<WebSocketConfig>,
}

impl WebSocketTransport {
    /// Build a transport for the given endpoint.
    ///
    /// Top-level fields of `params` are appended to the query string; string
    /// values are appended verbatim, everything else as JSON.
    pub fn new(
        mut endpoint: Url,
        vsn: Vsn,
        params: &Value,
        websocket_config: Option<WebSocketConfig>,
    ) -> Self {
        {
            let mut query = endpoint.query_pairs_mut();
            query.append_pair("vsn", vsn.as_str());
            if let Some(object) = params.as_object() {
                for (key, value) in object {
                    match value {
                        Value::String(s) => query.append_pair(key, s),
                        other => query.append_pair(key, &other.to_string()),
                    };
                }
            }
        }
        Self {
            endpoint,
            websocket_config,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Sink = WsSink;
    type Stream = WsStream;

    async fn connect(&mut self) -> Result<(WsSink, WsStream), TransportError> {
        let (stream, _response) =
            connect_async_with_config(self.endpoint.as_str(), self.websocket_config.clone(), false)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((WsSink { inner: sink }, WsStream { inner: stream }))
    }
}

/// Outbound half of a [`WebSocketTransport`] connection.
pub struct WsSink {
    inner: SplitSink<TungsteniteStream, tungstenite::Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(tungstenite::Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.inner.send(tungstenite::Message::Close(Some(frame))).await;
        let _ = self.inner.close().await;
    }
}

/// Inbound half of a [`WebSocketTransport`] connection.
pub struct WsStream {
    inner: SplitStream<TungsteniteStream>,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn next(&mut self) -> Option<TransportEvent> {
        loop {
            return match self.inner.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    Some(TransportEvent::Message(text))
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    Some(TransportEvent::Closed { code, reason })
                }
                // Pings and pongs are handled by tungstenite itself; binary
                // frames are not part of this protocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => Some(TransportEvent::Error(e.to_string())),
                None => None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_carries_vsn_and_params() {
        let url = Url::parse("ws://localhost:4000/socket/websocket").unwrap();
        let transport = WebSocketTransport::new(
            url,
            Vsn::V2,
            &json!({"token": "abc", "shard": 3}),
            None,
        );
        let query = transport.endpoint.query().unwrap();
        assert!(query.contains("vsn=2.0.0"));
        assert!(query.contains("token=abc"));
        assert!(query.contains("shard=3"));
    }
}
