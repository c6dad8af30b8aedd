//! Identity keys, signed pre-keys, one-time pre-keys and the published
//! pre-key bundle.
//!
//! All asymmetric keys are X25519. The signed pre-key carries an
//! HMAC-SHA-256 keyed by the identity private key rather than a true
//! signature; anyone holding the identity private key can produce it, so
//! authentication is deniable. The key directory holds the private halves
//! and verifies by recomputation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use vaultke_shared::constants::SPK_SIGNATURE_DOMAIN;

use crate::error::{CryptoError, Result};
use crate::primitives::{ct_eq, generate_x25519, hmac_sha256, MacTag};

/// A long-lived X25519 identity pair for one (user, device).
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let (secret, public) = generate_x25519();
        Self { secret, public }
    }

    pub fn from_base64(public: &str, secret: &str) -> Result<Self> {
        let public = decode_public(public)?;
        let secret = decode_secret(secret)?;
        Ok(Self { secret, public })
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    pub fn secret_base64(&self) -> String {
        BASE64.encode(self.secret.as_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &BASE64.encode(self.public.as_bytes()))
            .finish()
    }
}

/// A pre-key pair with its numeric ID. Used for both signed pre-keys and
/// one-time pre-keys; only the signed variant carries a signature.
pub struct PreKeyPair {
    pub id: u32,
    secret: StaticSecret,
    public: PublicKey,
}

impl PreKeyPair {
    pub fn generate(id: u32) -> Self {
        let (secret, public) = generate_x25519();
        Self { id, secret, public }
    }

    pub fn from_base64(id: u32, public: &str, secret: &str) -> Result<Self> {
        Ok(Self {
            id,
            public: decode_public(public)?,
            secret: decode_secret(secret)?,
        })
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    pub fn secret_base64(&self) -> String {
        BASE64.encode(self.secret.as_bytes())
    }
}

impl std::fmt::Debug for PreKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyPair")
            .field("id", &self.id)
            .field("public", &BASE64.encode(self.public.as_bytes()))
            .finish()
    }
}

/// Generate a batch of one-time pre-keys with consecutive IDs.
pub fn generate_one_time_pre_keys(start_id: u32, count: usize) -> Vec<PreKeyPair> {
    (0..count)
        .map(|i| PreKeyPair::generate(start_id.wrapping_add(i as u32)))
        .collect()
}

/// Sign a pre-key public half with the identity private key.
///
/// `HMAC-SHA-256(identity_secret, domain ‖ pre_key_public)`.
pub fn sign_pre_key(identity: &StaticSecret, pre_key_public: &PublicKey) -> Result<MacTag> {
    hmac_sha256(
        identity.as_bytes(),
        &[SPK_SIGNATURE_DOMAIN, pre_key_public.as_bytes()],
    )
}

/// Recompute and compare a pre-key signature. The comparison is
/// constant-time; mismatch is `BadIdentity`.
pub fn verify_pre_key(
    identity: &StaticSecret,
    pre_key_public: &PublicKey,
    signature: &[u8],
) -> Result<()> {
    let expected = sign_pre_key(identity, pre_key_public)?;
    if ct_eq(&expected, signature) {
        Ok(())
    } else {
        Err(CryptoError::BadIdentity)
    }
}

/// Random registration ID in the conventional 14-bit range.
pub fn generate_registration_id() -> u32 {
    rand::rngs::OsRng.gen_range(1..=16380)
}

/// The published view of one device's keys, assembled on demand by the
/// key directory. Key fields are base64; `preKey`/`preKeyId` are absent
/// when the one-time pool is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub user_id: String,
    pub device_id: String,
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_pre_key: String,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key_id: Option<u32>,
}

impl PreKeyBundle {
    pub fn identity_public(&self) -> Result<PublicKey> {
        decode_public(&self.identity_key)
    }

    pub fn signed_pre_key_public(&self) -> Result<PublicKey> {
        decode_public(&self.signed_pre_key)
    }

    pub fn one_time_public(&self) -> Result<Option<PublicKey>> {
        self.pre_key.as_deref().map(decode_public).transpose()
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.signed_pre_key_signature)
            .map_err(|_| CryptoError::BadIdentity)
    }
}

pub fn decode_public(encoded: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(decode_key_bytes(encoded)?))
}

pub fn decode_secret(encoded: &str) -> Result<StaticSecret> {
    Ok(StaticSecret::from(decode_key_bytes(encoded)?))
}

fn decode_key_bytes(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: 0,
        })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })
}
