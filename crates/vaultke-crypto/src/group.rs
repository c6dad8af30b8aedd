//! Group room encryption.
//!
//! Rooms use a single symmetric key derived from the room ID alone, so
//! any party that knows the ID can encrypt and decrypt past and future
//! traffic. There is no ratchet and no per-member state; the envelope's
//! session ID and recipient are both the room ID and the counter stays
//! at zero.

use serde_json::{Map, Value};

use vaultke_shared::constants::ROOM_KEY_PREFIX;
use vaultke_shared::{Envelope, EnvelopeError, SecurityLevel};

use crate::cipher::{decrypt_with_keys, seal, DecryptedMessage};
use crate::error::Result;
use crate::primitives::sha256;
use crate::session::MessageKeys;

/// `SHA-256("room-key-" ‖ room_id)`.
pub fn room_key(room_id: &str) -> [u8; 32] {
    sha256(&[ROOM_KEY_PREFIX, room_id.as_bytes()])
}

pub fn encrypt_group(
    sender_id: &str,
    room_id: &str,
    content: &str,
    metadata: Option<Map<String, Value>>,
) -> Result<Envelope> {
    let keys = MessageKeys::symmetric(room_key(room_id));
    seal(
        &keys,
        sender_id,
        room_id,
        room_id,
        0,
        SecurityLevel::GroupEncrypted,
        content,
        metadata,
    )
}

/// Decrypt a group envelope. The room key is derived from the envelope's
/// session ID, which carries the room ID.
pub fn decrypt_group(envelope: &Envelope) -> Result<DecryptedMessage> {
    if envelope.security_level != SecurityLevel::GroupEncrypted {
        return Err(
            EnvelopeError::SecurityLevel(envelope.security_level.as_str().to_owned()).into(),
        );
    }
    let keys = MessageKeys::symmetric(room_key(&envelope.session_id));
    decrypt_with_keys(&keys, envelope)
}
