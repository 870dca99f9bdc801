#![deny(missing_docs)]

//! Client for Phoenix-style realtime channels over WebSocket.
//!
//! Many logical topics are multiplexed over one [`Socket`]. Each
//! [`Channel`] is joined once and then maintains its membership on its own:
//! it rejoins with backoff when the transport drops or the server errors the
//! topic, buffers pushes made while not joined, and drops inbound messages
//! left over from a previous join incarnation.
//!
//! ```no_run
//! use serde_json::json;
//! use trellis::{PushStatus, Socket};
//! use url::Url;
//!
//! # fn run() -> Result<(), trellis::Error> {
//! let endpoint = Url::parse("ws://localhost:4000/socket/websocket").unwrap();
//! let socket = Socket::builder(endpoint).build();
//! socket.connect();
//!
//! let channel = socket.channel("rooms:lobby", json!({}));
//! channel
//!     .join()?
//!     .receive(PushStatus::Ok, |reply| println!("joined: {reply}"));
//!
//! channel.on("new_msg", |message| println!("{}", message.payload));
//! channel.push("new_msg", json!({"body": "hi"}))?;
//! # Ok(())
//! # }
//! ```

/// Channels for sending/receiving messages related to a topic.
pub mod channel;
/// Error handling.
pub mod error;
/// The wire envelope and its serializers.
pub mod message;
/// Outbound requests and their reply correlation.
pub mod push;
/// Socket multiplexing many channels over one transport.
pub mod socket;
/// The transport capability the socket is driven through.
pub mod transport;

mod timer;

pub use channel::{Channel, ChannelStatus, Message, Subscription};
pub use error::{Error, Result};
pub use message::event::{Event, ProtocolEvent};
pub use message::{Envelope, PushStatus, Vsn};
pub use push::Push;
pub use socket::{Socket, SocketBuilder, SocketStatus, SocketSubscription};
pub use transport::{
    Transport, TransportError, TransportEvent, TransportSink, TransportStream, WebSocketTransport,
};
