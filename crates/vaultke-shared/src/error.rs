use thiserror::Error;

/// Reasons the codec rejects an envelope before any key material is used.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Unsupported envelope version: {0:?}")]
    Version(String),

    #[error("Missing or empty field: {0}")]
    EmptyField(&'static str),

    #[error("Field {0} is not valid base64")]
    Base64(&'static str),

    #[error("Integrity hash is not a 64-character hex digest")]
    IntegrityEncoding,

    #[error("Unknown security level: {0:?}")]
    SecurityLevel(String),

    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}
