//! JSON WebSocket protocol for room collaboration.
//!
//! Every transport frame carries one JSON object with a `type` field. Inbound
//! frames are decoded in two steps: the envelope first (so an unknown type can
//! be told apart from a malformed payload), then the type-specific body.
//! Outbound frames are encoded once into [`Bytes`] and shared by every
//! recipient's queue.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{Operation, OperationKind};
use super::ConnectionId;

/// Protocol errors. All of them are confined to the frame that caused them.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(#[from] serde_json::Error),

    #[error("Invalid {kind} frame: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Frame is not valid UTF-8")]
    NotUtf8,
}

// ============================================================================
// INBOUND
// ============================================================================

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    body: Value,
}

/// Identity binding sent once the client knows who it is
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitFrame {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationFrame {
    operation: EditPayload,
}

/// A client edit before the server stamps it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditPayload {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    pub content: String,
    pub length: usize,
}

impl EditPayload {
    /// Stamp the edit with its originating connection and arrival time
    pub fn stamp(self, client_id: impl Into<ConnectionId>, timestamp: i64) -> Operation {
        Operation {
            kind: self.kind,
            position: self.position,
            content: self.content,
            length: self.length,
            client_id: client_id.into(),
            timestamp,
        }
    }
}

/// Title/language change
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetadataFrame {
    pub title: String,
    pub language: String,
}

/// Client-submitted full content
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnapshotFrame {
    pub content: String,
    /// Correlation number echoed back in the ack
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Cursor position relay
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PresenceFrame {
    pub username: String,
    pub color: String,
    #[serde(rename = "lineNumber")]
    pub line_number: u32,
    pub column: u32,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Init(InitFrame),
    Operation(EditPayload),
    Ping,
    DocumentUpdate(MetadataFrame),
    Snapshot(SnapshotFrame),
    PresenceUser(PresenceFrame),
}

impl ClientFrame {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { kind, body } = serde_json::from_str(text)?;

        let frame = match kind.as_str() {
            "init" => ClientFrame::Init(body_of(&kind, body)?),
            "operation" => {
                let frame: OperationFrame = body_of(&kind, body)?;
                ClientFrame::Operation(frame.operation)
            }
            "ping" => ClientFrame::Ping,
            "document_update" => ClientFrame::DocumentUpdate(body_of(&kind, body)?),
            "snapshot" => ClientFrame::Snapshot(body_of(&kind, body)?),
            "presence_user" => ClientFrame::PresenceUser(body_of(&kind, body)?),
            _ => return Err(ProtocolError::UnknownType(kind)),
        };

        Ok(frame)
    }

    /// Decode a binary frame holding UTF-8 JSON
    pub fn decode_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }

    /// Name of the frame type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Init(_) => "init",
            ClientFrame::Operation(_) => "operation",
            ClientFrame::Ping => "ping",
            ClientFrame::DocumentUpdate(_) => "document_update",
            ClientFrame::Snapshot(_) => "snapshot",
            ClientFrame::PresenceUser(_) => "presence_user",
        }
    }
}

fn body_of<T: serde::de::DeserializeOwned>(kind: &str, body: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// A room member as listed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
}

/// Metadata change as broadcast to the room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataChange {
    pub title: String,
    pub language: String,
    pub client_id: ConnectionId,
    pub timestamp: i64,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full state sent once to a joining member
    #[serde(rename = "snapshot")]
    JoinSnapshot {
        id: String,
        content: String,
        title: String,
        language: String,
        version: u64,
        users: Vec<UserInfo>,
    },

    UserJoined {
        id: String,
        username: String,
    },

    UserLeft {
        id: String,
        username: String,
    },

    /// Identity confirmation
    InitOk {
        id: String,
        username: String,
    },

    Operation {
        operation: Operation,
    },

    DocumentUpdate {
        document_update: MetadataChange,
    },

    /// Content replaced by another member
    #[serde(rename = "snapshot")]
    SnapshotUpdate {
        content: String,
        users: Vec<UserInfo>,
    },

    PresenceUser {
        id: String,
        username: String,
        color: String,
        #[serde(rename = "lineNumber")]
        line_number: u32,
        column: u32,
    },

    Ack {
        event: String,
        seq: u64,
        /// Milliseconds since the Unix epoch
        ts: i64,
    },

    Pong,
}

impl ServerFrame {
    /// Serialize once; the result is cheap to clone per recipient
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn snapshot_ack(seq: u64) -> Self {
        ServerFrame::Ack {
            event: "snapshot".to_string(),
            seq,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Wall clock in nanoseconds since the epoch, used to stamp edits and
/// metadata changes
pub fn now_nanos() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros() * 1000)
}

/// Pre-encoded application-level pong
pub fn pong_frame() -> Bytes {
    Bytes::from_static(br#"{"type":"pong"}"#)
}
