use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};

use self::event::{Event, ProtocolEvent};

/// Event type definitions for the wire protocol.
pub mod event;

/// The wire unit of the protocol.
///
/// One envelope is one text frame in either direction. `reference`
/// correlates a push with its reply; `join_ref` identifies the join
/// incarnation the message belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Ref of the push that joined the current incarnation of the topic.
    pub join_ref: Option<String>,
    /// Per-socket monotonic ref correlating a push with its reply.
    pub reference: Option<String>,
    /// The topic this message belongs to, e.g. `"rooms:lobby"`.
    pub topic: String,
    /// The event name.
    pub event: Event,
    /// The payload.
    pub payload: Value,
}

impl Envelope {
    /// A heartbeat envelope on the reserved `"phoenix"` topic.
    pub fn heartbeat(reference: String) -> Self {
        Self {
            join_ref: None,
            reference: Some(reference),
            topic: "phoenix".to_string(),
            event: Event::Protocol(ProtocolEvent::Heartbeat),
            payload: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Wire serializer version.
///
/// V2 is the array form `[join_ref, ref, topic, event, payload]`; V1 is the
/// equivalent object form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Vsn {
    /// JSON object form.
    V1,
    /// JSON array form (Phoenix v2 serializer).
    #[default]
    V2,
}

/// Object form of an [`Envelope`], used by the V1 serializer.
#[derive(Serialize, Deserialize)]
struct ObjectEnvelope {
    #[serde(default)]
    join_ref: Option<String>,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    topic: String,
    event: Event,
    payload: Value,
}

type ArrayEnvelope = (Option<String>, Option<String>, String, Event, Value);

impl Vsn {
    /// The `vsn` query parameter value announced to the server.
    pub fn as_str(&self) -> &'static str {
        match self {
            Vsn::V1 => "1.0.0",
            Vsn::V2 => "2.0.0",
        }
    }

    /// Encode an envelope to a text frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, serde_json::Error> {
        match self {
            Vsn::V1 => serde_json::to_string(&ObjectEnvelope {
                join_ref: envelope.join_ref.clone(),
                reference: envelope.reference.clone(),
                topic: envelope.topic.clone(),
                event: envelope.event.clone(),
                payload: envelope.payload.clone(),
            }),
            Vsn::V2 => serde_json::to_string(&(
                &envelope.join_ref,
                &envelope.reference,
                &envelope.topic,
                &envelope.event,
                &envelope.payload,
            )),
        }
    }

    /// Decode a text frame into an envelope.
    pub fn decode(&self, text: &str) -> Result<Envelope, serde_json::Error> {
        match self {
            Vsn::V1 => {
                let obj: ObjectEnvelope = serde_json::from_str(text)?;
                Ok(Envelope {
                    join_ref: obj.join_ref,
                    reference: obj.reference,
                    topic: obj.topic,
                    event: obj.event,
                    payload: obj.payload,
                })
            }
            Vsn::V2 => {
                let (join_ref, reference, topic, event, payload): ArrayEnvelope =
                    serde_json::from_str(text)?;
                Ok(Envelope {
                    join_ref,
                    reference,
                    topic,
                    event,
                    payload,
                })
            }
        }
    }
}

/// Status of a reply, as carried in the reply payload's `status` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PushStatus {
    /// The request was accepted.
    Ok,
    /// The server rejected the request.
    Error,
    /// No reply arrived within the push's deadline (synthesized locally).
    Timeout,
    /// Any other server-defined status.
    Other(String),
}

impl From<&str> for PushStatus {
    fn from(value: &str) -> Self {
        match value {
            "ok" => PushStatus::Ok,
            "error" => PushStatus::Error,
            "timeout" => PushStatus::Timeout,
            other => PushStatus::Other(other.to_string()),
        }
    }
}

impl Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PushStatus::Ok => "ok",
            PushStatus::Error => "error",
            PushStatus::Timeout => "timeout",
            PushStatus::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

/// Extract the status from a reply payload of the shape
/// `{"status": .., "response": ..}`.
pub(crate) fn reply_status(payload: &Value) -> Option<PushStatus> {
    payload.get("status")?.as_str().map(PushStatus::from)
}
