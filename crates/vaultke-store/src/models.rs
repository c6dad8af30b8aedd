//! Domain model structs persisted in the database.
//!
//! Every output struct derives `Serialize` with wire-facing field names so
//! the HTTP layer can hand records straight to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use vaultke_shared::{MessageKind, RoomRole, RoomType, SecurityLevel};

// ---------------------------------------------------------------------------
// Devices and key material
// ---------------------------------------------------------------------------

/// A registered (user, device) row. Retired rows stay behind with
/// `is_active = false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub registration_id: u32,
    pub signed_pre_key_id: Option<u32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to register (or re-register) a device, key material
/// included. Key fields are base64.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub user_id: String,
    pub device_id: String,
    pub registration_id: u32,
    pub identity_public: String,
    pub identity_private: String,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: String,
    pub signed_pre_key_private: String,
    pub signed_pre_key_signature: String,
    #[serde(default)]
    pub one_time_pre_keys: Vec<NewPreKey>,
}

/// One uploaded one-time pre-key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPreKey {
    pub id: u32,
    pub public_key: String,
    pub private_key: String,
}

/// Result of a bundle draw: the published view plus whether the one-time
/// pool was empty at draw time.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedBundle {
    #[serde(flatten)]
    pub bundle: vaultke_crypto::PreKeyBundle,
    pub exhausted: bool,
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// A chat room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub name: Option<String>,
    pub chama_id: Option<String>,
    pub created_by: String,
    pub is_active: bool,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A (room, user) membership row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub role: RoomRole,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub muted: bool,
}

/// One entry of a user's room list: the room plus that user's view of it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: Room,
    pub role: RoomRole,
    pub muted: bool,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A stored message. `content` holds either plaintext (system and other
/// unencrypted kinds) or a serialized envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<Value>,
    pub file_url: Option<String>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Whether clients should run this record through decryption. Driven
    /// by the stored security level alone, never by the shape of the
    /// content.
    pub fn needs_decryption(&self) -> bool {
        metadata_security_level(self.metadata.as_ref()).is_some()
    }
}

/// Input for appending to the archive.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<Value>,
    pub file_url: Option<String>,
    pub reply_to_id: Option<String>,
}

/// Read the security level recorded in a message's metadata blob, if any.
pub fn metadata_security_level(metadata: Option<&Value>) -> Option<SecurityLevel> {
    metadata?
        .get(vaultke_shared::constants::META_SECURITY_LEVEL)?
        .as_str()
        .and_then(SecurityLevel::parse)
}
