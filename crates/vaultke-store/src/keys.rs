//! The key directory: device registration, pre-key inventory and bundle
//! issuance.
//!
//! This directory is the trust root of the deployment: it keeps both
//! halves of every key so the backend can run the handshake and session
//! ciphers on behalf of clients. Bundle issuance consumes one-time
//! pre-keys destructively inside the issuing transaction, which is what
//! keeps two concurrent draws from ever seeing the same pre-key.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use vaultke_crypto::PreKeyBundle;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Device, DeviceRegistration, IssuedBundle, NewPreKey};

impl Database {
    /// Register a new (user, device) with its full key set. Fails with
    /// `Conflict` when an active registration already exists.
    pub fn register_device(&mut self, reg: &DeviceRegistration) -> Result<Device> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let live: i64 = tx.query_row(
            "SELECT COUNT(*) FROM devices
             WHERE user_id = ?1 AND device_id = ?2 AND is_active = 1",
            params![reg.user_id, reg.device_id],
            |row| row.get(0),
        )?;
        if live > 0 {
            return Err(StoreError::Conflict(format!(
                "device {} already registered for {}",
                reg.device_id, reg.user_id
            )));
        }

        let device = Device {
            id: Uuid::new_v4().to_string(),
            user_id: reg.user_id.clone(),
            device_id: reg.device_id.clone(),
            registration_id: reg.registration_id,
            signed_pre_key_id: Some(reg.signed_pre_key_id),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        insert_device_keys(&tx, reg, &device)?;

        tx.commit()?;
        tracing::info!(
            user_id = %reg.user_id,
            device_id = %reg.device_id,
            pre_keys = reg.one_time_pre_keys.len(),
            "registered device"
        );
        Ok(device)
    }

    /// Replace a device registration wholesale: the prior row is retired,
    /// its one-time pre-keys are dropped, and every session the user
    /// participates in is erased, since the old identity no longer
    /// vouches for them.
    pub fn reregister_device(&mut self, reg: &DeviceRegistration) -> Result<Device> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let retired = tx.execute(
            "UPDATE devices SET is_active = 0, updated_at = ?3
             WHERE user_id = ?1 AND device_id = ?2 AND is_active = 1",
            params![reg.user_id, reg.device_id, now.to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM one_time_pre_keys WHERE user_id = ?1 AND device_id = ?2",
            params![reg.user_id, reg.device_id],
        )?;
        let erased_sessions = tx.execute(
            "DELETE FROM sessions WHERE user_a_id = ?1 OR user_b_id = ?1",
            params![reg.user_id],
        )?;

        let device = Device {
            id: Uuid::new_v4().to_string(),
            user_id: reg.user_id.clone(),
            device_id: reg.device_id.clone(),
            registration_id: reg.registration_id,
            signed_pre_key_id: Some(reg.signed_pre_key_id),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        insert_device_keys(&tx, reg, &device)?;

        tx.commit()?;
        tracing::info!(
            user_id = %reg.user_id,
            device_id = %reg.device_id,
            retired,
            erased_sessions,
            "re-registered device"
        );
        Ok(device)
    }

    /// Replace the signed pre-key for an active device and point the
    /// device row at the new ID.
    pub fn rotate_signed_pre_key(
        &mut self,
        user_id: &str,
        device_id: &str,
        signed_pre_key_id: u32,
        public_key: &str,
        private_key: &str,
        signature: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let updated = tx.execute(
            "UPDATE devices SET signed_pre_key_id = ?3, updated_at = ?4
             WHERE user_id = ?1 AND device_id = ?2 AND is_active = 1",
            params![user_id, device_id, signed_pre_key_id, now.to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "INSERT OR REPLACE INTO signed_pre_keys
             (user_id, device_id, signed_pre_key_id, public_key, private_key, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                device_id,
                signed_pre_key_id,
                public_key,
                private_key,
                signature,
                now.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        tracing::info!(user_id, device_id, signed_pre_key_id, "rotated signed pre-key");
        Ok(())
    }

    /// Append one-time pre-keys for an active device. A duplicate
    /// (user, device, pre-key ID) is a `Conflict`.
    pub fn upload_pre_keys(
        &mut self,
        user_id: &str,
        device_id: &str,
        pre_keys: &[NewPreKey],
    ) -> Result<usize> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let live: i64 = tx.query_row(
            "SELECT COUNT(*) FROM devices
             WHERE user_id = ?1 AND device_id = ?2 AND is_active = 1",
            params![user_id, device_id],
            |row| row.get(0),
        )?;
        if live == 0 {
            return Err(StoreError::NotFound);
        }

        for key in pre_keys {
            tx.execute(
                "INSERT INTO one_time_pre_keys
                 (user_id, device_id, pre_key_id, public_key, private_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    device_id,
                    key.id,
                    key.public_key,
                    key.private_key,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| map_conflict(e, format!("pre-key {} already uploaded", key.id)))?;
        }

        tx.commit()?;
        Ok(pre_keys.len())
    }

    /// Assemble a pre-key bundle for one of the user's active devices.
    ///
    /// The chosen one-time pre-key is deleted before the transaction
    /// commits; when the pool is empty the bundle is still issued with
    /// `exhausted` set so the caller can prompt for a refill.
    pub fn issue_bundle(&mut self, user_id: &str) -> Result<IssuedBundle> {
        let tx = self.conn_mut().transaction()?;

        let device: Option<(String, u32)> = tx
            .query_row(
                "SELECT device_id, registration_id FROM devices
                 WHERE user_id = ?1 AND is_active = 1
                 ORDER BY RANDOM() LIMIT 1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (device_id, registration_id) = device.ok_or(StoreError::NotFound)?;

        let identity_key: String = tx
            .query_row(
                "SELECT public_key FROM identity_keys
                 WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        let signed: Option<(u32, String, String)> = tx
            .query_row(
                "SELECT signed_pre_key_id, public_key, signature FROM signed_pre_keys
                 WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (signed_pre_key_id, signed_pre_key, signed_pre_key_signature) =
            signed.ok_or(StoreError::NotFound)?;

        let one_time: Option<(u32, String)> = tx
            .query_row(
                "SELECT pre_key_id, public_key FROM one_time_pre_keys
                 WHERE user_id = ?1 AND device_id = ?2
                 ORDER BY RANDOM() LIMIT 1",
                params![user_id, device_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((pre_key_id, _)) = &one_time {
            tx.execute(
                "DELETE FROM one_time_pre_keys
                 WHERE user_id = ?1 AND device_id = ?2 AND pre_key_id = ?3",
                params![user_id, device_id, pre_key_id],
            )?;
        }

        tx.commit()?;

        let exhausted = one_time.is_none();
        if exhausted {
            tracing::warn!(user_id, %device_id, "one-time pre-key pool exhausted");
        }
        let (pre_key_id, pre_key) = one_time.unzip();

        Ok(IssuedBundle {
            bundle: PreKeyBundle {
                user_id: user_id.to_owned(),
                device_id,
                registration_id,
                identity_key,
                signed_pre_key,
                signed_pre_key_id,
                signed_pre_key_signature,
                pre_key,
                pre_key_id,
            },
            exhausted,
        })
    }

    /// Identity key pair (public, private; both base64) of the user's
    /// most recently registered active device.
    pub fn identity_key_pair(&self, user_id: &str) -> Result<(String, String)> {
        self.conn()
            .query_row(
                "SELECT i.public_key, i.private_key
                 FROM identity_keys i
                 JOIN devices d ON d.user_id = i.user_id AND d.device_id = i.device_id
                 WHERE i.user_id = ?1 AND d.is_active = 1
                 ORDER BY d.created_at DESC LIMIT 1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Signed pre-key private half for a device, needed by the responder
    /// side of the handshake.
    pub fn signed_pre_key_private(&self, user_id: &str, device_id: &str) -> Result<(u32, String)> {
        self.conn()
            .query_row(
                "SELECT signed_pre_key_id, private_key FROM signed_pre_keys
                 WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Symmetric fingerprint over two users' identity keys.
    pub fn compute_safety_number(&self, user_a: &str, user_b: &str) -> Result<String> {
        let (key_a, _) = self.identity_key_pair(user_a)?;
        let (key_b, _) = self.identity_key_pair(user_b)?;
        Ok(vaultke_crypto::safety::safety_number(&key_a, &key_b))
    }
}

fn insert_device_keys(
    tx: &rusqlite::Transaction<'_>,
    reg: &DeviceRegistration,
    device: &Device,
) -> Result<()> {
    tx.execute(
        "INSERT INTO devices
         (id, user_id, device_id, registration_id, signed_pre_key_id, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
        params![
            device.id,
            device.user_id,
            device.device_id,
            device.registration_id,
            device.signed_pre_key_id,
            device.created_at.to_rfc3339(),
            device.updated_at.to_rfc3339(),
        ],
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO identity_keys
         (user_id, device_id, public_key, private_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            reg.user_id,
            reg.device_id,
            reg.identity_public,
            reg.identity_private,
            device.created_at.to_rfc3339(),
        ],
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO signed_pre_keys
         (user_id, device_id, signed_pre_key_id, public_key, private_key, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            reg.user_id,
            reg.device_id,
            reg.signed_pre_key_id,
            reg.signed_pre_key_public,
            reg.signed_pre_key_private,
            reg.signed_pre_key_signature,
            device.created_at.to_rfc3339(),
        ],
    )?;
    for key in &reg.one_time_pre_keys {
        tx.execute(
            "INSERT INTO one_time_pre_keys
             (user_id, device_id, pre_key_id, public_key, private_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reg.user_id,
                reg.device_id,
                key.id,
                key.public_key,
                key.private_key,
                device.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| map_conflict(e, format!("pre-key {} already uploaded", key.id)))?;
    }
    Ok(())
}

fn map_conflict(e: rusqlite::Error, message: String) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(message)
        }
        other => StoreError::Sqlite(other),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use vaultke_crypto::keys::{
        generate_one_time_pre_keys, generate_registration_id, sign_pre_key, PreKeyPair,
    };
    use vaultke_crypto::IdentityKeyPair;

    pub(crate) fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    pub(crate) fn registration(user: &str, device: &str, pre_keys: usize) -> DeviceRegistration {
        let identity = IdentityKeyPair::generate();
        let spk = PreKeyPair::generate(1);
        let signature = sign_pre_key(identity.secret(), spk.public()).unwrap();

        DeviceRegistration {
            user_id: user.to_owned(),
            device_id: device.to_owned(),
            registration_id: generate_registration_id(),
            identity_public: identity.public_base64(),
            identity_private: identity.secret_base64(),
            signed_pre_key_id: spk.id,
            signed_pre_key_public: spk.public_base64(),
            signed_pre_key_private: spk.secret_base64(),
            signed_pre_key_signature: BASE64.encode(signature),
            one_time_pre_keys: generate_one_time_pre_keys(1, pre_keys)
                .iter()
                .map(|k| NewPreKey {
                    id: k.id,
                    public_key: k.public_base64(),
                    private_key: k.secret_base64(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_register_then_duplicate_conflicts() {
        let (_dir, mut db) = open_test_db();

        let device = db.register_device(&registration("user-a", "phone", 2)).unwrap();
        assert!(device.is_active);
        assert_eq!(device.signed_pre_key_id, Some(1));

        let err = db.register_device(&registration("user-a", "phone", 0));
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        // A different device for the same user is fine.
        db.register_device(&registration("user-a", "laptop", 0)).unwrap();
    }

    #[test]
    fn test_reregister_retires_and_erases_sessions() {
        let (_dir, mut db) = open_test_db();
        db.register_device(&registration("user-a", "phone", 1)).unwrap();
        db.register_device(&registration("user-b", "phone", 1)).unwrap();

        let state = crate::sessions::tests::sample_state("ab".repeat(32));
        db.put_session("user-a", "user-b", &state).unwrap();

        db.reregister_device(&registration("user-a", "phone", 1)).unwrap();

        assert!(matches!(
            db.get_session("user-a", "user-b"),
            Err(StoreError::NotFound)
        ));

        let live: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM devices WHERE user_id = 'user-a' AND is_active = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let retired: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM devices WHERE user_id = 'user-a' AND is_active = 0",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(live, 1);
        assert_eq!(retired, 1);
    }

    #[test]
    fn test_rotate_signed_pre_key() {
        let (_dir, mut db) = open_test_db();
        db.register_device(&registration("user-a", "phone", 0)).unwrap();

        let spk = PreKeyPair::generate(2);
        db.rotate_signed_pre_key(
            "user-a",
            "phone",
            spk.id,
            &spk.public_base64(),
            &spk.secret_base64(),
            "c2ln",
        )
        .unwrap();

        let bundle = db.issue_bundle("user-a").unwrap();
        assert_eq!(bundle.bundle.signed_pre_key_id, 2);
        assert_eq!(bundle.bundle.signed_pre_key, spk.public_base64());

        assert!(matches!(
            db.rotate_signed_pre_key("user-a", "tablet", 3, "pk", "sk", "sig"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_upload_duplicate_pre_key_conflicts() {
        let (_dir, mut db) = open_test_db();
        db.register_device(&registration("user-a", "phone", 3)).unwrap();

        let fresh = PreKeyPair::generate(1); // ID 1 was uploaded at registration
        let err = db.upload_pre_keys(
            "user-a",
            "phone",
            &[NewPreKey {
                id: fresh.id,
                public_key: fresh.public_base64(),
                private_key: fresh.secret_base64(),
            }],
        );
        assert!(matches!(err, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_bundle_draw_consumes_pre_keys() {
        let (_dir, mut db) = open_test_db();
        db.register_device(&registration("user-b", "phone", 0)).unwrap();

        // Empty pool: bundle still issued, flagged exhausted.
        let bundle = db.issue_bundle("user-b").unwrap();
        assert!(bundle.exhausted);
        assert!(bundle.bundle.pre_key.is_none());

        let refill = generate_one_time_pre_keys(100, 10)
            .iter()
            .map(|k| NewPreKey {
                id: k.id,
                public_key: k.public_base64(),
                private_key: k.secret_base64(),
            })
            .collect::<Vec<_>>();
        db.upload_pre_keys("user-b", "phone", &refill).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let issued = db.issue_bundle("user-b").unwrap();
            assert!(!issued.exhausted);
            assert!(seen.insert(issued.bundle.pre_key_id.unwrap()));
        }
        assert!(db.issue_bundle("user-b").unwrap().exhausted);
    }

    #[test]
    fn test_bundle_for_unknown_user() {
        let (_dir, mut db) = open_test_db();
        assert!(matches!(db.issue_bundle("nobody"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_safety_number_symmetric() {
        let (_dir, mut db) = open_test_db();
        db.register_device(&registration("user-a", "phone", 0)).unwrap();
        db.register_device(&registration("user-b", "phone", 0)).unwrap();

        let ab = db.compute_safety_number("user-a", "user-b").unwrap();
        let ba = db.compute_safety_number("user-b", "user-a").unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 16);

        assert!(matches!(
            db.compute_safety_number("user-a", "nobody"),
            Err(StoreError::NotFound)
        ));
    }
}
