//! # vaultke-shared
//!
//! Wire types common to the VaultKe messaging backend: the encrypted
//! envelope and its structural validation, the relay socket frames, domain
//! enums, and protocol constants.
//!
//! Nothing in this crate touches key material; everything here is safe to
//! use on either side of the relay.

pub mod constants;
pub mod envelope;
pub mod frames;
pub mod types;

mod error;

pub use envelope::Envelope;
pub use error::EnvelopeError;
pub use frames::{ClientFrame, SendMessage, ServerFrame};
pub use types::{MessageKind, RoomRole, RoomType, SecurityLevel};
