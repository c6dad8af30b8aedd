//! Messaging service: drives the crypto crate against the store.
//!
//! The store owns persistence and the crypto crate owns byte transforms;
//! this layer sequences them. It holds the only piece of state that lives
//! in neither: message keys skipped over when a counter jumped ahead,
//! cached briefly so late arrivals can still be decrypted.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::{debug, info};

use vaultke_crypto::cipher::{self, DecryptedMessage};
use vaultke_crypto::group;
use vaultke_crypto::handshake::{self, fresh_session_id};
use vaultke_crypto::keys::{decode_secret, verify_pre_key};
use vaultke_crypto::{CryptoError, IdentityKeyPair, MessageKeys, SessionState};
use vaultke_shared::constants::SKIP_WINDOW;
use vaultke_shared::{Envelope, SecurityLevel};
use vaultke_store::{Database, StoreError};

use crate::error::Result;

/// Stateless apart from the skipped-key cache; one instance is shared by
/// every connection and request handler.
#[derive(Default)]
pub struct MessagingService {
    /// Message keys for numbers the receive cursor has already passed,
    /// keyed by session ID. Bounded per session; consumed on use.
    skipped: Mutex<HashMap<String, HashMap<u32, MessageKeys>>>,
}

impl MessagingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish a pairwise session, drawing a bundle from the responder's
    /// key directory. Idempotent: an existing session for the pair is
    /// returned untouched, without consuming a one-time pre-key.
    pub fn establish_session(
        &self,
        db: &mut Database,
        initiator: &str,
        responder: &str,
    ) -> Result<SessionState> {
        match db.get_session(initiator, responder) {
            Ok(existing) => return Ok(existing),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let issued = db.issue_bundle(responder)?;

        // The bundle signature is keyed by the responder identity secret,
        // which the directory holds.
        let (_, responder_secret) = db.identity_key_pair(responder)?;
        let responder_secret = decode_secret(&responder_secret)?;
        verify_pre_key(
            &responder_secret,
            &issued.bundle.signed_pre_key_public()?,
            &issued.bundle.signature_bytes()?,
        )?;

        let (initiator_public, initiator_secret) = db.identity_key_pair(initiator)?;
        let initiator_identity = IdentityKeyPair::from_base64(&initiator_public, &initiator_secret)?;

        let (keys, _) = handshake::initiate(&initiator_identity, &issued.bundle)?;
        let state = SessionState::new(fresh_session_id(), &keys);
        db.put_session(initiator, responder, &state)?;

        info!(
            initiator,
            responder,
            session = %state.session_id,
            one_time_key = issued.bundle.pre_key_id.is_some(),
            "Session established"
        );
        Ok(state)
    }

    /// Encrypt a pairwise message, establishing a session first if the
    /// pair has none.
    pub fn encrypt_direct(
        &self,
        db: &mut Database,
        sender: &str,
        recipient: &str,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Envelope> {
        let mut session = match db.get_session(sender, recipient) {
            Ok(session) => session,
            Err(StoreError::NotFound) => self.establish_session(db, sender, recipient)?,
            Err(e) => return Err(e.into()),
        };

        let envelope = cipher::encrypt_direct(&mut session, sender, recipient, content, metadata)?;
        db.put_session(sender, recipient, &session)?;
        Ok(envelope)
    }

    /// Decrypt a pairwise envelope and advance the receive cursor.
    ///
    /// Numbers behind the cursor are served from the skipped-key cache,
    /// each at most once; a miss is `OUT_OF_ORDER`. Integrity and
    /// authentication failures leave both the cursor and the cache
    /// untouched.
    pub fn decrypt_direct(&self, db: &mut Database, envelope: &Envelope) -> Result<DecryptedMessage> {
        let mut session = db.get_session(&envelope.sender_id, &envelope.recipient_id)?;

        if envelope.message_number < session.recv_count {
            let keys = self
                .take_skipped(&envelope.session_id, envelope.message_number)
                .ok_or(CryptoError::OutOfOrder {
                    expected: session.recv_count,
                    got: envelope.message_number,
                })?;
            debug!(
                session = %envelope.session_id,
                number = envelope.message_number,
                "Late arrival served from skipped-key cache"
            );
            return Ok(cipher::decrypt_with_keys(&keys, envelope)?);
        }

        let (message, skipped) = cipher::decrypt_direct(&mut session, envelope)?;
        self.stash_skipped(&session.session_id, skipped);
        db.put_session(&envelope.sender_id, &envelope.recipient_id, &session)?;
        Ok(message)
    }

    /// Encrypt for a room under the shared room key.
    pub fn encrypt_group(
        &self,
        sender: &str,
        room_id: &str,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Envelope> {
        Ok(group::encrypt_group(sender, room_id, content, metadata)?)
    }

    pub fn decrypt_group(&self, envelope: &Envelope) -> Result<DecryptedMessage> {
        Ok(group::decrypt_group(envelope)?)
    }

    /// Decrypt any envelope, dispatching on its security level.
    pub fn decrypt(&self, db: &mut Database, envelope: &Envelope) -> Result<DecryptedMessage> {
        match envelope.security_level {
            SecurityLevel::MilitaryGrade => self.decrypt_direct(db, envelope),
            SecurityLevel::GroupEncrypted => self.decrypt_group(envelope),
        }
    }

    /// Drop the pair's session row and any cached skipped keys. The next
    /// message between the pair performs a fresh handshake.
    pub fn reset_sessions(&self, db: &Database, user_a: &str, user_b: &str) -> Result<usize> {
        if let Ok(session) = db.get_session(user_a, user_b) {
            self.lock_cache().remove(&session.session_id);
        }
        let deleted = db.delete_sessions_between(user_a, user_b)?;
        info!(user_a, user_b, deleted, "Sessions reset");
        Ok(deleted)
    }

    fn take_skipped(&self, session_id: &str, number: u32) -> Option<MessageKeys> {
        let mut cache = self.lock_cache();
        let entry = cache.get_mut(session_id)?;
        let keys = entry.remove(&number);
        if entry.is_empty() {
            cache.remove(session_id);
        }
        keys
    }

    fn stash_skipped(&self, session_id: &str, skipped: Vec<(u32, MessageKeys)>) {
        if skipped.is_empty() {
            return;
        }
        let mut cache = self.lock_cache();
        let entry = cache.entry(session_id.to_string()).or_default();
        for (number, keys) in skipped {
            entry.insert(number, keys);
        }
        // Oldest numbers go first when the per-session bound is exceeded.
        while entry.len() > SKIP_WINDOW as usize {
            let Some(&oldest) = entry.keys().min() else {
                break;
            };
            entry.remove(&oldest);
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<u32, MessageKeys>>> {
        self.skipped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    use vaultke_crypto::keys::{generate_one_time_pre_keys, sign_pre_key, PreKeyPair};
    use vaultke_store::{DeviceRegistration, NewPreKey};

    pub(crate) fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    /// Fresh key material for one device of `user_id`.
    pub(crate) fn registration_for(user_id: &str, pre_keys: usize) -> DeviceRegistration {
        let identity = IdentityKeyPair::generate();
        let spk = PreKeyPair::generate(1);
        let signature = sign_pre_key(identity.secret(), spk.public()).unwrap();
        let one_time = generate_one_time_pre_keys(100, pre_keys)
            .iter()
            .map(|k| NewPreKey {
                id: k.id,
                public_key: k.public_base64(),
                private_key: k.secret_base64(),
            })
            .collect();
        DeviceRegistration {
            user_id: user_id.to_string(),
            device_id: format!("{user_id}-phone"),
            registration_id: 7,
            identity_public: identity.public_base64(),
            identity_private: identity.secret_base64(),
            signed_pre_key_id: spk.id,
            signed_pre_key_public: spk.public_base64(),
            signed_pre_key_private: spk.secret_base64(),
            signed_pre_key_signature: BASE64.encode(signature),
            one_time_pre_keys: one_time,
        }
    }

    pub(crate) fn register(db: &mut Database, user_id: &str, pre_keys: usize) {
        db.register_device(&registration_for(user_id, pre_keys)).unwrap();
    }

    #[test]
    fn test_establish_is_idempotent() {
        let (_dir, mut db) = open_db();
        register(&mut db, "alice", 5);
        register(&mut db, "bob", 5);
        let service = MessagingService::new();

        let first = service.establish_session(&mut db, "alice", "bob").unwrap();
        let second = service.establish_session(&mut db, "bob", "alice").unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[test]
    fn test_direct_roundtrip_advances_cursors() {
        let (_dir, mut db) = open_db();
        register(&mut db, "alice", 5);
        register(&mut db, "bob", 5);
        let service = MessagingService::new();
        service.establish_session(&mut db, "alice", "bob").unwrap();

        let envelope = service
            .encrypt_direct(&mut db, "alice", "bob", "Karibu kwenye chama", None)
            .unwrap();
        assert_eq!(envelope.message_number, 0);

        let message = service.decrypt_direct(&mut db, &envelope).unwrap();
        assert_eq!(message.content, "Karibu kwenye chama");

        let session = db.get_session("alice", "bob").unwrap();
        assert_eq!(session.send_count, 1);
        assert_eq!(session.recv_count, 1);
    }

    #[test]
    fn test_encrypt_establishes_on_first_message() {
        let (_dir, mut db) = open_db();
        register(&mut db, "alice", 5);
        register(&mut db, "bob", 5);
        let service = MessagingService::new();

        assert!(matches!(
            db.get_session("alice", "bob"),
            Err(StoreError::NotFound)
        ));

        let envelope = service
            .encrypt_direct(&mut db, "alice", "bob", "first contact", None)
            .unwrap();
        let session = db.get_session("alice", "bob").unwrap();
        assert_eq!(envelope.session_id, session.session_id);

        let message = service.decrypt_direct(&mut db, &envelope).unwrap();
        assert_eq!(message.content, "first contact");
    }

    #[test]
    fn test_out_of_order_served_once_from_cache() {
        let (_dir, mut db) = open_db();
        register(&mut db, "alice", 5);
        register(&mut db, "bob", 5);
        let service = MessagingService::new();

        let mut envelopes = Vec::new();
        for i in 0..3 {
            envelopes.push(
                service
                    .encrypt_direct(&mut db, "alice", "bob", &format!("msg {i}"), None)
                    .unwrap(),
            );
        }

        service.decrypt_direct(&mut db, &envelopes[0]).unwrap();
        let m2 = service.decrypt_direct(&mut db, &envelopes[2]).unwrap();
        assert_eq!(m2.content, "msg 2");

        // The skipped number is still decryptable, exactly once.
        let m1 = service.decrypt_direct(&mut db, &envelopes[1]).unwrap();
        assert_eq!(m1.content, "msg 1");

        let err = service.decrypt_direct(&mut db, &envelopes[1]).unwrap_err();
        assert_eq!(err.kind(), "OUT_OF_ORDER");
    }

    #[test]
    fn test_skipped_cache_evicts_oldest() {
        let (_dir, mut db) = open_db();
        register(&mut db, "alice", 5);
        register(&mut db, "bob", 5);
        let service = MessagingService::new();

        let mut envelopes = Vec::new();
        for i in 0..65 {
            envelopes.push(
                service
                    .encrypt_direct(&mut db, "alice", "bob", &format!("msg {i}"), None)
                    .unwrap(),
            );
        }

        // Two maximal jumps: 0, then 32 (skipping 1..=31), then 64
        // (skipping 33..=63). 62 cached keys exceed the bound, so the
        // oldest are dropped.
        service.decrypt_direct(&mut db, &envelopes[0]).unwrap();
        service.decrypt_direct(&mut db, &envelopes[32]).unwrap();
        service.decrypt_direct(&mut db, &envelopes[64]).unwrap();

        let err = service.decrypt_direct(&mut db, &envelopes[1]).unwrap_err();
        assert_eq!(err.kind(), "OUT_OF_ORDER");

        let late = service.decrypt_direct(&mut db, &envelopes[63]).unwrap();
        assert_eq!(late.content, "msg 63");
    }

    #[test]
    fn test_tamper_fails_without_advancing_cursor() {
        let (_dir, mut db) = open_db();
        register(&mut db, "alice", 5);
        register(&mut db, "bob", 5);
        let service = MessagingService::new();

        let envelope = service
            .encrypt_direct(&mut db, "alice", "bob", "usiharibu ujumbe", None)
            .unwrap();

        let mut tampered = envelope.clone();
        tampered.ciphertext = format!("AAAA{}", &tampered.ciphertext[4..]);
        let err = service.decrypt_direct(&mut db, &tampered).unwrap_err();
        assert_eq!(err.kind(), "INTEGRITY");

        let session = db.get_session("alice", "bob").unwrap();
        assert_eq!(session.recv_count, 0);

        // The untouched original still decrypts.
        let message = service.decrypt_direct(&mut db, &envelope).unwrap();
        assert_eq!(message.content, "usiharibu ujumbe");
    }

    #[test]
    fn test_group_roundtrip_needs_no_session() {
        let (_dir, mut db) = open_db();
        let service = MessagingService::new();

        let envelope = service
            .encrypt_group("alice", "room-9", "mchango umefika", None)
            .unwrap();
        assert_eq!(envelope.session_id, "room-9");
        assert_eq!(envelope.message_number, 0);

        let message = service.decrypt(&mut db, &envelope).unwrap();
        assert_eq!(message.content, "mchango umefika");
    }

    #[test]
    fn test_reset_forces_fresh_handshake() {
        let (_dir, mut db) = open_db();
        register(&mut db, "alice", 5);
        register(&mut db, "bob", 5);
        let service = MessagingService::new();

        let old = service.establish_session(&mut db, "alice", "bob").unwrap();
        let deleted = service.reset_sessions(&db, "alice", "bob").unwrap();
        assert_eq!(deleted, 1);
        assert!(matches!(
            db.get_session("alice", "bob"),
            Err(StoreError::NotFound)
        ));

        let renewed = service.establish_session(&mut db, "alice", "bob").unwrap();
        assert_ne!(old.session_id, renewed.session_id);
    }
}
