//! # vaultke-crypto
//!
//! End-to-end encryption for VaultKe messaging: AES-256-GCM primitives,
//! X25519 identity and pre-key material, the pre-key handshake, pairwise
//! sessions with hash-chain ratcheting, and the shared-key group fabric.
//!
//! The crate does no I/O. Persistence of keys and sessions lives in
//! `vaultke-store`; this crate only transforms bytes.

pub mod cipher;
pub mod group;
pub mod handshake;
pub mod keys;
pub mod primitives;
pub mod safety;
pub mod session;

mod error;

pub use cipher::DecryptedMessage;
pub use error::{CryptoError, Result};
pub use handshake::{HandshakeMessage, SessionKeys};
pub use keys::{IdentityKeyPair, PreKeyBundle, PreKeyPair};
pub use session::{MessageKeys, SessionState};
