//! Pre-key handshake: establishes a pairwise session from a published
//! bundle.
//!
//! Triple (optionally quadruple) Diffie-Hellman in the Signal X3DH shape:
//!
//! - DH1 = initiator identity × responder signed pre-key
//! - DH2 = initiator ephemeral × responder identity
//! - DH3 = initiator ephemeral × responder signed pre-key
//! - DH4 = initiator ephemeral × responder one-time pre-key (when present)
//!
//! The concatenated outputs feed HKDF-SHA-256 with a zero salt and the
//! protocol info string, expanded to 96 bytes: a root key and two chain
//! blocks. The directory keeps one session row per pair, so both chain
//! cursors start from the first chain block.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use vaultke_shared::constants::KDF_INFO;

use crate::error::Result;
use crate::keys::{decode_public, IdentityKeyPair, PreKeyBundle, PreKeyPair};
use crate::primitives::{generate_x25519, hkdf_sha256, random_array, x25519};

/// Key material for a fresh session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    root_key: [u8; 32],
    chain_seed: [u8; 32],
}

impl SessionKeys {
    pub fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }

    pub fn chain_seed(&self) -> &[u8; 32] {
        &self.chain_seed
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKeys([REDACTED])")
    }
}

/// Carried alongside the initiator's first envelope so the responder can
/// derive the same keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    /// Initiator identity public key, base64.
    pub identity_key: String,
    /// Initiator ephemeral public key, base64.
    pub ephemeral_key: String,
    pub signed_pre_key_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
}

/// Run the initiator side against a responder bundle.
///
/// Signature verification over the bundle happens in the key directory
/// before this is called; this function only performs the agreement.
pub fn initiate(
    identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(SessionKeys, HandshakeMessage)> {
    let responder_identity = bundle.identity_public()?;
    let responder_spk = bundle.signed_pre_key_public()?;
    let responder_otp = bundle.one_time_public()?;

    let (ephemeral_secret, ephemeral_public) = generate_x25519();

    let dh1 = x25519(identity.secret(), &responder_spk);
    let dh2 = x25519(&ephemeral_secret, &responder_identity);
    let dh3 = x25519(&ephemeral_secret, &responder_spk);
    let dh4 = responder_otp.map(|otp| x25519(&ephemeral_secret, &otp));

    let keys = derive_session_keys(&dh1, &dh2, &dh3, dh4.as_ref())?;

    let message = HandshakeMessage {
        identity_key: identity.public_base64(),
        ephemeral_key: BASE64.encode(ephemeral_public.as_bytes()),
        signed_pre_key_id: bundle.signed_pre_key_id,
        one_time_pre_key_id: bundle.pre_key_id,
    };

    Ok((keys, message))
}

/// Run the responder side from the initiator's handshake message and the
/// responder's stored private keys.
pub fn respond(
    identity: &IdentityKeyPair,
    signed_pre_key: &PreKeyPair,
    one_time_pre_key: Option<&PreKeyPair>,
    message: &HandshakeMessage,
) -> Result<SessionKeys> {
    let initiator_identity = decode_public(&message.identity_key)?;
    let initiator_ephemeral = decode_public(&message.ephemeral_key)?;

    let dh1 = x25519(signed_pre_key.secret(), &initiator_identity);
    let dh2 = x25519(identity.secret(), &initiator_ephemeral);
    let dh3 = x25519(signed_pre_key.secret(), &initiator_ephemeral);
    let dh4 = one_time_pre_key.map(|otp| x25519(otp.secret(), &initiator_ephemeral));

    derive_session_keys(&dh1, &dh2, &dh3, dh4.as_ref())
}

fn derive_session_keys(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> Result<SessionKeys> {
    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }

    let mut out = [0u8; 96];
    let result = hkdf_sha256(&ikm, Some(&[0u8; 32]), KDF_INFO, &mut out);
    ikm.zeroize();
    result?;

    let mut root_key = [0u8; 32];
    let mut chain_seed = [0u8; 32];
    root_key.copy_from_slice(&out[..32]);
    chain_seed.copy_from_slice(&out[32..64]);
    out.zeroize();

    Ok(SessionKeys { root_key, chain_seed })
}

/// Fresh 64-hex session identifier.
pub fn fresh_session_id() -> String {
    hex::encode(random_array::<32>())
}
