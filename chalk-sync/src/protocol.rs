//! Versioned wire protocol between clients and the coordinator.
//!
//! Every frame is a JSON object carried in one WebSocket message:
//! ```text
//! { "v": 1, "type": "stroke", "body": { "stroke": {...}, "lsn": 42 } }
//! ```
//!
//! Decoding happens in two steps: the envelope first, then the body for the
//! named kind. Unknown kinds decode to [`Message::Unknown`] so the receiver
//! can log and skip them; unknown fields inside a body are ignored. Both
//! rules let a newer peer add fields and kinds without breaking older ones.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::oplog::Lsn;
use crate::storage::Snapshot;
use crate::stroke::{Stroke, StrokeId};

/// Version written into every frame this build emits.
pub const PROTOCOL_VERSION: u16 = 1;

/// Announce a session on a whiteboard. First frame on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub whiteboard_id: Uuid,
    pub author: String,
    /// Highest own counter per author the client has applied.
    #[serde(default)]
    pub last_known_clock: VectorClock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeMsg {
    pub stroke: Stroke,
    /// Commit position; absent on client submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<Lsn>,
}

/// Client to server: "applied everything up to `lsn`".
/// Server to client: "your stroke `stroke_id` committed at `lsn`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub lsn: Lsn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_id: Option<StrokeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub whiteboard_id: Uuid,
    pub authors: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leave {
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
    /// The refused stroke, when the error is about one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_id: Option<StrokeId>,
}

/// Catch-up payload: a full snapshot, missing strokes, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catchup {
    pub head_lsn: Lsn,
    /// Present when the receiver must replace its canvas.
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    /// Strokes to apply after the snapshot (or to the current canvas), in
    /// merge order.
    #[serde(default)]
    pub strokes: Vec<Stroke>,
}

/// Client asks for the strokes it is missing relative to `clock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sync {
    #[serde(default)]
    pub clock: VectorClock,
}

/// Decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Join(Join),
    Stroke(StrokeMsg),
    Ack(Ack),
    Presence(Presence),
    Leave(Leave),
    Error(ErrorMsg),
    Catchup(Catchup),
    Sync(Sync),
    Heartbeat,
    /// A kind this build does not know.
    Unknown(String),
}

impl Message {
    pub fn join(whiteboard_id: Uuid, author: impl Into<String>, last_known_clock: VectorClock) -> Self {
        Message::Join(Join {
            whiteboard_id,
            author: author.into(),
            last_known_clock,
        })
    }

    pub fn stroke(stroke: Stroke, lsn: Option<Lsn>) -> Self {
        Message::Stroke(StrokeMsg { stroke, lsn })
    }

    pub fn ack(lsn: Lsn, stroke_id: Option<StrokeId>) -> Self {
        Message::Ack(Ack { lsn, stroke_id })
    }

    pub fn presence(whiteboard_id: Uuid, authors: impl IntoIterator<Item = String>) -> Self {
        Message::Presence(Presence {
            whiteboard_id,
            authors: authors.into_iter().collect(),
        })
    }

    pub fn leave(author: impl Into<String>) -> Self {
        Message::Leave(Leave {
            author: author.into(),
        })
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Message::Error(ErrorMsg {
            kind,
            message: message.into(),
            stroke_id: None,
        })
    }

    /// Refusal of one submitted stroke.
    pub fn rejected(kind: ErrorKind, message: impl Into<String>, stroke_id: StrokeId) -> Self {
        Message::Error(ErrorMsg {
            kind,
            message: message.into(),
            stroke_id: Some(stroke_id),
        })
    }

    pub fn catchup(head_lsn: Lsn, snapshot: Option<Snapshot>, strokes: Vec<Stroke>) -> Self {
        Message::Catchup(Catchup {
            head_lsn,
            snapshot,
            strokes,
        })
    }

    pub fn sync(clock: VectorClock) -> Self {
        Message::Sync(Sync { clock })
    }

    /// Wire name of this message's kind.
    pub fn kind(&self) -> &str {
        match self {
            Message::Join(_) => "join",
            Message::Stroke(_) => "stroke",
            Message::Ack(_) => "ack",
            Message::Presence(_) => "presence",
            Message::Leave(_) => "leave",
            Message::Error(_) => "error",
            Message::Catchup(_) => "catchup",
            Message::Sync(_) => "sync",
            Message::Heartbeat => "heartbeat",
            Message::Unknown(kind) => kind,
        }
    }

    /// Encode as a JSON frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let body = match self {
            Message::Join(b) => to_body(b)?,
            Message::Stroke(b) => to_body(b)?,
            Message::Ack(b) => to_body(b)?,
            Message::Presence(b) => to_body(b)?,
            Message::Leave(b) => to_body(b)?,
            Message::Error(b) => to_body(b)?,
            Message::Catchup(b) => to_body(b)?,
            Message::Sync(b) => to_body(b)?,
            Message::Heartbeat | Message::Unknown(_) => serde_json::Value::Object(Default::default()),
        };
        let frame = Frame {
            v: PROTOCOL_VERSION,
            kind: self.kind().to_string(),
            body,
        };
        serde_json::to_string(&frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode a frame received as text or binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let frame: Frame =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if frame.v == 0 {
            return Err(ProtocolError::UnsupportedVersion(frame.v));
        }
        if frame.v > PROTOCOL_VERSION {
            log::trace!("Decoding v{} frame best-effort", frame.v);
        }

        let kind = frame.kind.as_str();
        let body = frame.body;
        Ok(match kind {
            "join" => Message::Join(from_body(kind, body)?),
            "stroke" => Message::Stroke(from_body(kind, body)?),
            "ack" => Message::Ack(from_body(kind, body)?),
            "presence" => Message::Presence(from_body(kind, body)?),
            "leave" => Message::Leave(from_body(kind, body)?),
            "error" => Message::Error(from_body(kind, body)?),
            "catchup" => Message::Catchup(from_body(kind, body)?),
            "sync" => Message::Sync(from_body(kind, body)?),
            "heartbeat" => Message::Heartbeat,
            _ => Message::Unknown(kind.to_string()),
        })
    }
}

/// Envelope shared by every version.
#[derive(Serialize, Deserialize)]
struct Frame {
    v: u16,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: serde_json::Value,
}

fn to_body<T: Serialize>(body: &T) -> Result<serde_json::Value, ProtocolError> {
    serde_json::to_value(body).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_body<T: DeserializeOwned>(kind: &str, body: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|e| ProtocolError::InvalidBody {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Category carried by an `error` frame.
///
/// Unrecognized categories from newer peers survive as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    /// Stroke rejected at ingress; never entered the log.
    Validation,
    /// Stroke depends on state the server has not seen; send `sync`.
    CausalGap,
    /// Storage failed; reconnect and resync from the last acked LSN.
    Persistence,
    /// Malformed frame; the connection is closing.
    Protocol,
    Unauthorized,
    NotFound,
    /// A frame other than `join` arrived before joining.
    NotJoined,
    /// Session dropped for falling behind; rejoin to catch up.
    Resync,
    /// A newer session for the same author took over.
    Superseded,
    /// No heartbeat within the timeout.
    Timeout,
    Shutdown,
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::CausalGap => "causal_gap",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotJoined => "not_joined",
            ErrorKind::Resync => "resync",
            ErrorKind::Superseded => "superseded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Other(s) => s,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "validation" => ErrorKind::Validation,
            "causal_gap" => ErrorKind::CausalGap,
            "persistence" => ErrorKind::Persistence,
            "protocol" => ErrorKind::Protocol,
            "unauthorized" => ErrorKind::Unauthorized,
            "not_found" => ErrorKind::NotFound,
            "not_joined" => ErrorKind::NotJoined,
            "resync" => ErrorKind::Resync,
            "superseded" => ErrorKind::Superseded,
            "timeout" => ErrorKind::Timeout,
            "shutdown" => ErrorKind::Shutdown,
            _ => ErrorKind::Other(s),
        }
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid {kind} body: {reason}")]
    InvalidBody { kind: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
