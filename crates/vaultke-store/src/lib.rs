//! SQLite persistence for the VaultKe messaging backend.
//!
//! Four stores share one database: the key directory (devices, identity
//! keys, signed and one-time pre-keys), the pairwise session store, the
//! room and membership tables, and the message archive. All of them
//! hang off [`Database`] as `impl` blocks in their own modules.

pub mod database;
mod error;
pub mod keys;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod sessions;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::{
    Device, DeviceRegistration, IssuedBundle, NewMessage, NewPreKey, Room, RoomMember,
    RoomSummary, StoredMessage,
};
pub use sessions::normalize_pair;
