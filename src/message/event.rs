use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The event carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Event {
    /// Protocol-reserved events.
    Protocol(ProtocolEvent),
    /// Application-defined events.
    Custom(String),
}

impl Event {
    /// The synthetic event under which a reply to the push with the given
    /// ref is re-emitted on its channel.
    pub fn reply_for(reference: &str) -> Self {
        Event::Custom(format!("chan_reply_{reference}"))
    }
}

impl From<&str> for Event {
    fn from(value: &str) -> Self {
        match value {
            "heartbeat" => Event::Protocol(ProtocolEvent::Heartbeat),
            "phx_close" => Event::Protocol(ProtocolEvent::Close),
            "phx_error" => Event::Protocol(ProtocolEvent::Error),
            "phx_join" => Event::Protocol(ProtocolEvent::Join),
            "phx_reply" => Event::Protocol(ProtocolEvent::Reply),
            "phx_leave" => Event::Protocol(ProtocolEvent::Leave),
            other => Event::Custom(other.to_string()),
        }
    }
}

impl From<String> for Event {
    fn from(value: String) -> Self {
        Event::from(value.as_str())
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Protocol(e) => e.fmt(f),
            Event::Custom(e) => write!(f, "{}", e),
        }
    }
}

/// Protocol-reserved events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolEvent {
    /// Heartbeat, sent on the `"phoenix"` topic.
    #[serde(rename = "heartbeat")]
    Heartbeat,
    /// The channel was closed.
    #[serde(rename = "phx_close")]
    Close,
    /// The channel errored and needs to be rejoined.
    #[serde(rename = "phx_error")]
    Error,
    /// Joining a channel. (Outbound only.)
    #[serde(rename = "phx_join")]
    Join,
    /// Reply to a message sent by the client.
    #[serde(rename = "phx_reply")]
    Reply,
    /// Leaving a channel. (Outbound only.)
    #[serde(rename = "phx_leave")]
    Leave,
}

impl Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolEvent::Heartbeat => "heartbeat",
            ProtocolEvent::Close => "phx_close",
            ProtocolEvent::Error => "phx_error",
            ProtocolEvent::Join => "phx_join",
            ProtocolEvent::Reply => "phx_reply",
            ProtocolEvent::Leave => "phx_leave",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_deserialize_as_protocol_events() {
        let event: Event = serde_json::from_str(r#""phx_join""#).unwrap();
        assert_eq!(event, Event::Protocol(ProtocolEvent::Join));

        let event: Event = serde_json::from_str(r#""shout""#).unwrap();
        assert_eq!(event, Event::Custom("shout".to_string()));
    }

    #[test]
    fn protocol_events_serialize_to_reserved_names() {
        let text = serde_json::to_string(&Event::Protocol(ProtocolEvent::Reply)).unwrap();
        assert_eq!(text, r#""phx_reply""#);

        let text = serde_json::to_string(&Event::Custom("shout".to_string())).unwrap();
        assert_eq!(text, r#""shout""#);
    }

    #[test]
    fn from_str_round_trips_through_display() {
        let names = ["heartbeat", "phx_close", "phx_error", "phx_join", "phx_reply", "phx_leave", "shout"];
        for name in names {
            assert_eq!(Event::from(name).to_string(), name);
        }
    }

    #[test]
    fn reply_events_embed_the_ref() {
        assert_eq!(Event::reply_for("42"), Event::Custom("chan_reply_42".to_string()));
    }
}
