use thiserror::Error;

use vaultke_shared::EnvelopeError;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Signed pre-key signature verification failed")]
    BadIdentity,

    #[error("Integrity hash mismatch")]
    IntegrityFailure,

    #[error("Message authentication failed")]
    AuthFailure,

    #[error("Message number {got} outside the acceptance window (expected {expected})")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("Invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Padding malformed after decryption")]
    BadPadding,

    #[error("Key derivation failed")]
    KdfFailed,
}
