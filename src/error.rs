use std::result;
use thiserror::Error;

/// Convenience result type for this crate's error type.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Errors surfaced synchronously by channel and socket operations.
///
/// Transport faults and reply-level failures are not errors: the former are
/// state transitions that drive automatic rejoin, the latter are delivered to
/// a push's `"error"` (or `"timeout"`) receivers.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not (de)serialize a payload.
    #[error("could not (de)serialize")]
    Serde(#[from] serde_json::Error),
    /// `join` was called on a channel that was already joined once.
    #[error("channel already joined")]
    AlreadyJoined,
    /// `push` was called before the channel's first `join`.
    #[error("channel not joined")]
    NotJoined,
    /// The socket backing this channel has been dropped.
    #[error("underlying socket dropped")]
    SocketDropped,
}
