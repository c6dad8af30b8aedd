//! Pairwise message encryption and decryption.
//!
//! The plaintext never travels alone: it is wrapped in a canonical JSON
//! document together with a message ID, a unix timestamp and caller
//! metadata, and the metadata is padded with 32 to 95 random bytes so
//! ciphertext length does not track content length. The sealed envelope
//! carries three checks, outermost first: a keyless integrity hash over
//! the encoded fields, an HMAC bound to the recipient ID, and the AEAD
//! tag itself.
//!
//! Decryption accepts the HMAC in two forms. Older senders appended the
//! envelope timestamp to the MAC input; both are tried until the legacy
//! fleet ages out.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use vaultke_shared::constants::{
    ENVELOPE_VERSION, META_PADDING, META_TIMESTAMP, META_VERSION, PAD_MAX, PAD_MIN,
};
use vaultke_shared::{Envelope, SecurityLevel};

use crate::error::{CryptoError, Result};
use crate::primitives::{aead_decrypt, aead_encrypt, ct_eq, hmac_sha256, random_bytes, sha256};
use crate::session::{MessageKeys, SessionState};

/// The sealed document. Field names are part of the wire contract between
/// clients and must not change.
#[derive(Serialize, Deserialize)]
struct PlaintextDocument {
    content: String,
    timestamp_unix: i64,
    message_id: String,
    metadata: Map<String, Value>,
}

/// Decrypted content with the padding fields already stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedMessage {
    pub content: String,
    pub metadata: Map<String, Value>,
    pub message_id: String,
    pub timestamp_unix: i64,
}

/// Encrypt one message in an established session. Advances the send
/// cursor only after the envelope is fully assembled.
pub fn encrypt_direct(
    session: &mut SessionState,
    sender_id: &str,
    recipient_id: &str,
    content: &str,
    metadata: Option<Map<String, Value>>,
) -> Result<Envelope> {
    let keys = session.sending_keys()?;
    let envelope = seal(
        &keys,
        sender_id,
        recipient_id,
        &session.session_id,
        session.send_count,
        SecurityLevel::MilitaryGrade,
        content,
        metadata,
    )?;
    session.advance_send();
    Ok(envelope)
}

/// Decrypt an envelope against the session, advancing the receive cursor
/// on success. Skipped message keys (when the counter jumped ahead) are
/// returned for the caller to cache; a failure leaves the session exactly
/// as it was.
pub fn decrypt_direct(
    session: &mut SessionState,
    envelope: &Envelope,
) -> Result<(DecryptedMessage, Vec<(u32, MessageKeys)>)> {
    let plan = session.plan_receive(envelope.message_number)?;
    let message = decrypt_with_keys(plan.keys(), envelope)?;
    let skipped = session.commit_receive(plan);
    Ok((message, skipped))
}

/// Decrypt with explicit message keys, used for late arrivals whose keys
/// were cached when the counter skipped past them.
pub fn decrypt_with_keys(keys: &MessageKeys, envelope: &Envelope) -> Result<DecryptedMessage> {
    envelope.validate()?;

    let digest = sha256(&[envelope.integrity_input().as_bytes()]);
    let claimed = hex::decode(&envelope.integrity_hash)
        .map_err(|_| CryptoError::IntegrityFailure)?;
    if !ct_eq(&digest, &claimed) {
        return Err(CryptoError::IntegrityFailure);
    }

    let ciphertext = envelope.ciphertext_bytes()?;
    let iv = envelope.iv_bytes()?;
    let tag = envelope.auth_tag_bytes()?;

    let current = hmac_sha256(keys.mac(), &[&ciphertext, envelope.recipient_id.as_bytes()])?;
    let accepted = ct_eq(&current, &tag) || {
        let ts = envelope.timestamp.timestamp_millis().to_string();
        let legacy = hmac_sha256(
            keys.mac(),
            &[&ciphertext, envelope.recipient_id.as_bytes(), ts.as_bytes()],
        )?;
        ct_eq(&legacy, &tag)
    };
    if !accepted {
        return Err(CryptoError::AuthFailure);
    }

    let plaintext =
        aead_decrypt(keys.enc(), &iv, &ciphertext).map_err(|_| CryptoError::AuthFailure)?;
    let document: PlaintextDocument =
        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptionFailed)?;

    let mut metadata = document.metadata;
    strip_padding(&mut metadata);

    Ok(DecryptedMessage {
        content: document.content,
        metadata,
        message_id: document.message_id,
        timestamp_unix: document.timestamp_unix,
    })
}

/// Build a complete envelope from message keys. Shared between the
/// pairwise and group paths.
#[allow(clippy::too_many_arguments)]
pub(crate) fn seal(
    keys: &MessageKeys,
    sender_id: &str,
    recipient_id: &str,
    session_id: &str,
    message_number: u32,
    security_level: SecurityLevel,
    content: &str,
    metadata: Option<Map<String, Value>>,
) -> Result<Envelope> {
    let mut metadata = metadata.unwrap_or_default();
    pad_metadata(&mut metadata);

    let document = PlaintextDocument {
        content: content.to_owned(),
        timestamp_unix: Utc::now().timestamp(),
        message_id: Uuid::new_v4().to_string(),
        metadata,
    };
    let serialized = serde_json::to_vec(&document).map_err(|_| CryptoError::EncryptionFailed)?;

    let (ciphertext, iv) = aead_encrypt(keys.enc(), &serialized)?;
    let auth_tag = hmac_sha256(keys.mac(), &[&ciphertext, recipient_id.as_bytes()])?;

    let ciphertext_b64 = BASE64.encode(&ciphertext);
    let auth_tag_b64 = BASE64.encode(auth_tag);
    let iv_b64 = BASE64.encode(iv);
    let integrity_hash = hex::encode(sha256(&[
        ciphertext_b64.as_bytes(),
        auth_tag_b64.as_bytes(),
        iv_b64.as_bytes(),
    ]));

    Ok(Envelope {
        version: ENVELOPE_VERSION.to_owned(),
        sender_id: sender_id.to_owned(),
        recipient_id: recipient_id.to_owned(),
        ciphertext: ciphertext_b64,
        auth_tag: auth_tag_b64,
        iv: iv_b64,
        session_id: session_id.to_owned(),
        message_number,
        timestamp: Utc::now(),
        security_level,
        integrity_hash,
    })
}

fn pad_metadata(metadata: &mut Map<String, Value>) {
    let pad_len = rand::rngs::OsRng.gen_range(PAD_MIN..=PAD_MAX);
    metadata.insert(
        META_PADDING.to_owned(),
        Value::String(BASE64.encode(random_bytes(pad_len))),
    );
    metadata.insert(
        META_TIMESTAMP.to_owned(),
        Value::from(Utc::now().timestamp_millis()),
    );
    metadata.insert(
        META_VERSION.to_owned(),
        Value::String(ENVELOPE_VERSION.to_owned()),
    );
}

fn strip_padding(metadata: &mut Map<String, Value>) {
    metadata.remove(META_PADDING);
    metadata.remove(META_TIMESTAMP);
    metadata.remove(META_VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::fresh_session_id;

    /// The directory holds one session row per pair; encrypting and
    /// decrypting against the same state models exactly that.
    fn test_session() -> SessionState {
        SessionState {
            session_id: fresh_session_id(),
            root_key: [7u8; 32],
            send_chain: [9u8; 32],
            recv_chain: [9u8; 32],
            send_count: 0,
            recv_count: 0,
        }
    }

    #[test]
    fn test_round_trip() {
        let mut session = test_session();

        let mut metadata = Map::new();
        metadata.insert("chamaId".into(), Value::String("chama-9".into()));

        let envelope = encrypt_direct(
            &mut session,
            "user-a",
            "user-b",
            "karibu kwenye kikundi",
            Some(metadata.clone()),
        )
        .unwrap();
        assert_eq!(envelope.message_number, 0);
        assert_eq!(envelope.security_level, SecurityLevel::MilitaryGrade);
        assert_eq!(session.send_count, 1);

        let (message, skipped) = decrypt_direct(&mut session, &envelope).unwrap();
        assert_eq!(message.content, "karibu kwenye kikundi");
        assert_eq!(message.metadata, metadata);
        assert!(skipped.is_empty());
        assert_eq!(session.recv_count, 1);
    }

    #[test]
    fn test_sealed_document_carries_padding() {
        let session = test_session();
        let keys = session.sending_keys().unwrap();
        let envelope = seal(
            &keys,
            "user-a",
            "user-b",
            &session.session_id,
            0,
            SecurityLevel::MilitaryGrade,
            "hello",
            None,
        )
        .unwrap();

        let plaintext = aead_decrypt(
            keys.enc(),
            &envelope.iv_bytes().unwrap(),
            &envelope.ciphertext_bytes().unwrap(),
        )
        .unwrap();
        let document: Value = serde_json::from_slice(&plaintext).unwrap();

        let padding = document["metadata"][META_PADDING].as_str().unwrap();
        let pad_len = BASE64.decode(padding).unwrap().len();
        assert!((PAD_MIN..=PAD_MAX).contains(&pad_len));
        assert!(document["metadata"][META_TIMESTAMP].is_i64());
        assert_eq!(document["metadata"][META_VERSION], ENVELOPE_VERSION);
    }

    #[test]
    fn test_padding_stripped_from_output() {
        let mut session = test_session();
        let envelope = encrypt_direct(&mut session, "user-a", "user-b", "x", None).unwrap();
        let (message, _) = decrypt_direct(&mut session, &envelope).unwrap();
        assert!(message.metadata.is_empty());
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity_and_keeps_state() {
        let mut session = test_session();
        let mut envelope = encrypt_direct(&mut session, "user-a", "user-b", "hi", None).unwrap();

        // Re-encode with one flipped byte; integrity hash left as-is.
        let mut ct = envelope.ciphertext_bytes().unwrap();
        ct[0] ^= 0xFF;
        envelope.ciphertext = BASE64.encode(ct);

        assert!(matches!(
            decrypt_direct(&mut session, &envelope),
            Err(CryptoError::IntegrityFailure)
        ));
        assert_eq!(session.recv_count, 0);
    }

    #[test]
    fn test_tampered_tag_fails_auth() {
        let mut session = test_session();
        let mut envelope = encrypt_direct(&mut session, "user-a", "user-b", "hi", None).unwrap();

        // Break the MAC but keep the integrity hash consistent, so the
        // failure is attributable to authentication.
        let mut tag = envelope.auth_tag_bytes().unwrap();
        tag[0] ^= 0xFF;
        envelope.auth_tag = BASE64.encode(tag);
        envelope.integrity_hash = hex::encode(sha256(&[
            envelope.ciphertext.as_bytes(),
            envelope.auth_tag.as_bytes(),
            envelope.iv.as_bytes(),
        ]));

        assert!(matches!(
            decrypt_direct(&mut session, &envelope),
            Err(CryptoError::AuthFailure)
        ));
        assert_eq!(session.recv_count, 0);
    }

    #[test]
    fn test_rebound_recipient_fails_auth() {
        let mut session = test_session();
        let mut envelope = encrypt_direct(&mut session, "user-a", "user-b", "hi", None).unwrap();

        // The recipient sits outside the integrity preimage but inside
        // the MAC, so redirecting the envelope fails at authentication.
        envelope.recipient_id = "user-c".into();

        assert!(matches!(
            decrypt_direct(&mut session, &envelope),
            Err(CryptoError::AuthFailure)
        ));
        assert_eq!(session.recv_count, 0);
    }

    #[test]
    fn test_replay_rejected() {
        let mut session = test_session();
        let envelope = encrypt_direct(&mut session, "user-a", "user-b", "once", None).unwrap();

        decrypt_direct(&mut session, &envelope).unwrap();
        assert!(matches!(
            decrypt_direct(&mut session, &envelope),
            Err(CryptoError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_out_of_order_skip_and_late_arrival() {
        let mut session = test_session();
        let e0 = encrypt_direct(&mut session, "user-a", "user-b", "first", None).unwrap();
        let e1 = encrypt_direct(&mut session, "user-a", "user-b", "second", None).unwrap();
        let e2 = encrypt_direct(&mut session, "user-a", "user-b", "third", None).unwrap();

        // Third arrives first; its plan skips keys for 0 and 1.
        let (message, skipped) = decrypt_direct(&mut session, &e2).unwrap();
        assert_eq!(message.content, "third");
        assert_eq!(skipped.len(), 2);

        // Late envelopes decrypt with the cached keys.
        let (_, k0) = skipped.iter().find(|(n, _)| *n == 0).unwrap();
        let (_, k1) = skipped.iter().find(|(n, _)| *n == 1).unwrap();
        assert_eq!(decrypt_with_keys(k0, &e0).unwrap().content, "first");
        assert_eq!(decrypt_with_keys(k1, &e1).unwrap().content, "second");
    }

    #[test]
    fn test_legacy_mac_form_accepted() {
        let mut session = test_session();
        let mut envelope = encrypt_direct(&mut session, "user-a", "user-b", "old", None).unwrap();

        // Rewrite the tag the way older senders computed it.
        let keys = {
            let planned = session.plan_receive(0).unwrap();
            planned.keys().clone()
        };
        let ts = envelope.timestamp.timestamp_millis().to_string();
        let legacy = hmac_sha256(
            keys.mac(),
            &[
                &envelope.ciphertext_bytes().unwrap(),
                envelope.recipient_id.as_bytes(),
                ts.as_bytes(),
            ],
        )
        .unwrap();
        envelope.auth_tag = BASE64.encode(legacy);
        envelope.integrity_hash = hex::encode(sha256(&[
            envelope.ciphertext.as_bytes(),
            envelope.auth_tag.as_bytes(),
            envelope.iv.as_bytes(),
        ]));

        let (message, _) = decrypt_direct(&mut session, &envelope).unwrap();
        assert_eq!(message.content, "old");
    }

    #[test]
    fn test_wrong_session_fails_cleanly() {
        let mut sender = test_session();
        let envelope = encrypt_direct(&mut sender, "user-a", "user-b", "hi", None).unwrap();

        let mut other = SessionState {
            session_id: fresh_session_id(),
            root_key: [3u8; 32],
            send_chain: [4u8; 32],
            recv_chain: [4u8; 32],
            send_count: 0,
            recv_count: 0,
        };
        assert!(matches!(
            decrypt_direct(&mut other, &envelope),
            Err(CryptoError::AuthFailure)
        ));
    }
}
