//! Relay socket frames. JSON with a `type` tag, snake_case tags and
//! camelCase fields, matching the envelope wire conventions.

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::types::{MessageKind, SecurityLevel};

/// Frames a connected client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe this connection to a room's fan-out.
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    /// Unsubscribe from a room.
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    /// Submit a message for encryption (or relay) and fan-out.
    SendMessage { data: SendMessage },
    /// Heartbeat; answered with `pong`, no state touched.
    Ping,
}

/// Frames the server pushes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Greeting sent once after a successful upgrade.
    Connected {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Pong,
    /// A message archived in a room this connection subscribes to. `data`
    /// is the stored message record as JSON.
    NewMessage {
        #[serde(rename = "roomId")]
        room_id: String,
        data: serde_json::Value,
    },
    /// Non-fatal error; the connection stays open.
    Error { message: String },
}

/// Payload of a `send_message` frame.
///
/// Two shapes are accepted: plaintext fields (`content` plus `kind`), which
/// the server encrypts before archiving, or a pre-built `envelope`, which
/// is validated and relayed opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

impl SendMessage {
    /// Plain text submission with no extras.
    pub fn text(room_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            kind: MessageKind::Text,
            content: Some(content.into()),
            metadata: None,
            security_level: None,
            reply_to_id: None,
            file_url: None,
            envelope: None,
        }
    }
}
