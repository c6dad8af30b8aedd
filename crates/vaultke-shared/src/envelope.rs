//! The versioned wire envelope produced by encryption and consumed by
//! decryption.
//!
//! An envelope carries only opaque material (base64 ciphertext, MAC tag,
//! IV) plus routing fields, so the relay can validate and forward it
//! without any key material. `integrityHash` binds the three opaque fields
//! together; the preimage is the concatenated base64 text so the check
//! needs no decoding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::ENVELOPE_VERSION;
use crate::error::EnvelopeError;
use crate::types::SecurityLevel;

/// A single encrypted message on the wire. Field names are the JSON wire
/// names; all of them are case-sensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: String,
    pub sender_id: String,
    /// User ID for pairwise envelopes, room ID for group envelopes.
    pub recipient_id: String,
    pub ciphertext: String,
    pub auth_tag: String,
    pub iv: String,
    /// Session ID for pairwise, room ID for group.
    pub session_id: String,
    /// Session counter for pairwise; always 0 for group.
    pub message_number: u32,
    #[serde(with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub security_level: SecurityLevel,
    /// Hex SHA-256 over `ciphertext ‖ authTag ‖ iv` (base64 text).
    pub integrity_hash: String,
}

impl Envelope {
    /// Parse an envelope from wire JSON. Unknown `securityLevel` values and
    /// malformed timestamps fail here.
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Parse an envelope from an already-deserialized JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_value(value)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Structural validation: version, non-empty routing fields, base64
    /// payload fields, hex digest. Everything here is checkable without
    /// keys.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::Version(self.version.clone()));
        }
        if self.sender_id.is_empty() {
            return Err(EnvelopeError::EmptyField("senderId"));
        }
        if self.recipient_id.is_empty() {
            return Err(EnvelopeError::EmptyField("recipientId"));
        }
        if self.session_id.is_empty() {
            return Err(EnvelopeError::EmptyField("sessionId"));
        }
        for (name, value) in [
            ("ciphertext", &self.ciphertext),
            ("authTag", &self.auth_tag),
            ("iv", &self.iv),
        ] {
            if value.is_empty() {
                return Err(EnvelopeError::EmptyField(name));
            }
            if BASE64.decode(value).is_err() {
                return Err(EnvelopeError::Base64(name));
            }
        }
        if self.integrity_hash.len() != 64
            || !self.integrity_hash.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(EnvelopeError::IntegrityEncoding);
        }
        Ok(())
    }

    /// Preimage of the integrity hash: the base64 fields concatenated in
    /// wire order.
    pub fn integrity_input(&self) -> String {
        let mut input =
            String::with_capacity(self.ciphertext.len() + self.auth_tag.len() + self.iv.len());
        input.push_str(&self.ciphertext);
        input.push_str(&self.auth_tag);
        input.push_str(&self.iv);
        input
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        BASE64
            .decode(&self.ciphertext)
            .map_err(|_| EnvelopeError::Base64("ciphertext"))
    }

    pub fn auth_tag_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        BASE64
            .decode(&self.auth_tag)
            .map_err(|_| EnvelopeError::Base64("authTag"))
    }

    pub fn iv_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        BASE64.decode(&self.iv).map_err(|_| EnvelopeError::Base64("iv"))
    }
}

/// Wire timestamps: epoch milliseconds or RFC-3339 accepted on decode,
/// RFC-3339 emitted on encode.
mod wire_timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Text(String),
        }

        match Raw::deserialize(de)? {
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| serde::de::Error::custom("timestamp out of range")),
            Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom),
        }
    }
}
