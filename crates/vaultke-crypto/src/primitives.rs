//! Thin wrappers over the cryptographic building blocks: AES-256-GCM,
//! HMAC-SHA-256, HKDF-SHA-256, X25519 and constant-time comparison.
//!
//! Everything above this module speaks in terms of these functions; no
//! other module constructs a cipher or MAC directly.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use vaultke_shared::constants::{AEAD_IV_SIZE, AEAD_KEY_SIZE, MAC_SIZE};

use crate::error::{CryptoError, Result};

pub type SymmetricKey = [u8; AEAD_KEY_SIZE];
pub type Iv = [u8; AEAD_IV_SIZE];
pub type MacTag = [u8; MAC_SIZE];

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

/// AES-256-GCM with a fresh random 96-bit IV. Returns the ciphertext
/// (GCM tag appended) and the IV separately; the envelope carries them in
/// separate fields.
pub fn aead_encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<(Vec<u8>, Iv)> {
    let cipher = Aes256Gcm::new(key.into());
    let iv: Iv = random_array();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok((ciphertext, iv))
}

pub fn aead_decrypt(key: &SymmetricKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != AEAD_IV_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: AEAD_IV_SIZE,
            got: iv.len(),
        });
    }
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// HMAC-SHA-256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<MacTag> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: MAC_SIZE,
            got: key.len(),
        }
    })?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// HKDF-SHA-256 expand into `out`. `salt = None` means the RFC 5869
/// all-zero salt.
pub fn hkdf_sha256(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, out).map_err(|_| CryptoError::KdfFailed)
}

pub fn x25519(secret: &StaticSecret, public: &PublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

pub fn generate_x25519() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Constant-time equality. Length mismatch returns false immediately;
/// lengths are not secret here.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key: SymmetricKey = random_array();
        let plaintext = b"pamoja tunaweza";

        let (ciphertext, iv) = aead_encrypt(&key, plaintext).unwrap();
        let decrypted = aead_decrypt(&key, &iv, &ciphertext).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let key: SymmetricKey = random_array();
        let (_, iv1) = aead_encrypt(&key, b"same input").unwrap();
        let (_, iv2) = aead_encrypt(&key, b"same input").unwrap();
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1: SymmetricKey = random_array();
        let key2: SymmetricKey = random_array();

        let (ciphertext, iv) = aead_encrypt(&key1, b"secret").unwrap();
        assert!(aead_decrypt(&key2, &iv, &ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key: SymmetricKey = random_array();
        let (mut ciphertext, iv) = aead_encrypt(&key, b"important").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(aead_decrypt(&key, &iv, &ciphertext).is_err());
    }

    #[test]
    fn test_bad_iv_length_rejected() {
        let key: SymmetricKey = random_array();
        let (ciphertext, _) = aead_encrypt(&key, b"x").unwrap();
        assert!(aead_decrypt(&key, &[0u8; 8], &ciphertext).is_err());
    }

    #[test]
    fn test_hmac_part_boundaries_do_not_matter() {
        let key = random_bytes(32);
        let one = hmac_sha256(&key, &[b"abc", b"def"]).unwrap();
        let two = hmac_sha256(&key, &[b"abcdef"]).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_hkdf_deterministic() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hkdf_sha256(b"ikm", None, b"info", &mut a).unwrap();
        hkdf_sha256(b"ikm", None, b"info", &mut b).unwrap();
        assert_eq!(a, b);

        let mut c = [0u8; 64];
        hkdf_sha256(b"ikm", None, b"other", &mut c).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_x25519_agreement() {
        let (sk_a, pk_a) = generate_x25519();
        let (sk_b, pk_b) = generate_x25519();
        assert_eq!(x25519(&sk_a, &pk_b), x25519(&sk_b, &pk_a));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"diff"));
        assert!(!ct_eq(b"short", b"longer"));
    }
}
