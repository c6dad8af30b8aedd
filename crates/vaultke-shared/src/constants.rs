/// Envelope wire format version accepted by the codec.
pub const ENVELOPE_VERSION: &str = "1.0";

/// HKDF info string for session and message key derivation.
pub const KDF_INFO: &[u8] = b"VaultKe-E2EE-v1.0";

/// Domain prefix hashed with the room ID to derive the group room key.
pub const ROOM_KEY_PREFIX: &[u8] = b"room-key-";

/// Domain prefix for signed-pre-key signatures.
pub const SPK_SIGNATURE_DOMAIN: &[u8] = b"VaultKe-SPK-v1";

/// AES-256-GCM key size in bytes.
pub const AEAD_KEY_SIZE: usize = 32;

/// AES-256-GCM IV size in bytes (96 bits).
pub const AEAD_IV_SIZE: usize = 12;

/// HMAC-SHA-256 tag size in bytes.
pub const MAC_SIZE: usize = 32;

/// Session identifiers are 64 lowercase hex characters (32 random bytes).
pub const SESSION_ID_LEN: usize = 64;

/// Minimum number of random padding bytes added to message metadata.
pub const PAD_MIN: usize = 32;

/// Maximum number of random padding bytes added to message metadata.
pub const PAD_MAX: usize = 95;

/// Reserved metadata keys stripped on decryption.
pub const META_PADDING: &str = "_padding";
pub const META_TIMESTAMP: &str = "_timestamp";
pub const META_VERSION: &str = "_version";

/// Metadata key recording the scheme an archived message was encrypted
/// with; drives the `needsDecryption` hint on fetches.
pub const META_SECURITY_LEVEL: &str = "securityLevel";

/// How many out-of-order message keys a receiver will derive ahead and
/// cache before giving up on a gap.
pub const SKIP_WINDOW: u32 = 32;

/// Capacity of a relay connection's outbound frame queue. Overflow evicts
/// the connection.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Consecutive malformed frames tolerated on one connection before the
/// relay drops it.
pub const MALFORMED_FRAME_LIMIT: u32 = 8;

/// Preview text stored for encrypted messages so room lists never show
/// plaintext.
pub const ENCRYPTED_PREVIEW: &str = "[Encrypted message]";

/// Default HTTP/WebSocket listen port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;
