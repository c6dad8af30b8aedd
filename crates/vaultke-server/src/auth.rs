//! Bearer-token authentication.
//!
//! Tokens are minted by the platform backend with the shared `AUTH_SECRET`
//! and take the form `user_id.expiry.tag`, where `expiry` is a unix
//! timestamp and `tag` is hex-encoded HMAC-SHA-256 over the first two
//! fields. The messaging server only verifies; it never stores accounts.

use std::sync::Arc;

use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;

use vaultke_crypto::primitives::{ct_eq, hmac_sha256};

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Authenticated user ID, inserted as a request extension by
/// [`require_bearer`].
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

/// Mint a token for `user_id` that expires `ttl_secs` from now.
pub fn mint_token(secret: &str, user_id: &str, ttl_secs: i64) -> String {
    let expiry = Utc::now().timestamp() + ttl_secs;
    let payload = format!("{user_id}.{expiry}");
    // The key is never empty, so HMAC construction cannot fail.
    let tag = hmac_sha256(secret.as_bytes(), &[payload.as_bytes()]).unwrap_or([0u8; 32]);
    format!("{payload}.{}", hex::encode(tag))
}

/// Verify a token and return the user ID it was minted for.
///
/// User IDs may themselves contain dots, so the token is split from the
/// right: the last two fields are expiry and tag, everything before them
/// is the user ID.
pub fn verify_token(secret: &str, token: &str) -> Result<String, ServerError> {
    let mut parts = token.rsplitn(3, '.');
    let (tag_hex, expiry_str, user_id) = match (parts.next(), parts.next(), parts.next()) {
        (Some(tag), Some(expiry), Some(user)) if !user.is_empty() => (tag, expiry, user),
        _ => return Err(ServerError::Unauthorized("malformed token".to_string())),
    };

    let expiry: i64 = expiry_str
        .parse()
        .map_err(|_| ServerError::Unauthorized("malformed token".to_string()))?;
    if expiry < Utc::now().timestamp() {
        return Err(ServerError::Unauthorized("token expired".to_string()));
    }

    let payload = format!("{user_id}.{expiry}");
    let expected = hmac_sha256(secret.as_bytes(), &[payload.as_bytes()])
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    let presented =
        hex::decode(tag_hex).map_err(|_| ServerError::Unauthorized("malformed token".to_string()))?;

    if !ct_eq(&expected, &presented) {
        return Err(ServerError::Unauthorized("invalid token".to_string()));
    }

    Ok(user_id.to_string())
}

/// Middleware that requires a valid `Authorization: Bearer` header and
/// exposes the verified user as an [`AuthUser`] extension.
pub async fn require_bearer(
    axum::extract::State(config): axum::extract::State<Arc<ServerConfig>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServerError::Unauthorized("missing bearer token".to_string()))?;

    let user_id = verify_token(&config.auth_secret, token)?;
    req.extensions_mut().insert(AuthUser(user_id));

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_verify_roundtrip() {
        let token = mint_token("secret", "user-123", 60);
        let user = verify_token("secret", &token).unwrap();
        assert_eq!(user, "user-123");
    }

    #[test]
    fn test_user_ids_may_contain_dots() {
        let token = mint_token("secret", "org.vaultke.user.42", 60);
        let user = verify_token("secret", &token).unwrap();
        assert_eq!(user, "org.vaultke.user.42");
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = mint_token("secret", "user-123", -5);
        let err = verify_token("secret", &token).unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = mint_token("secret-a", "user-123", 60);
        assert!(verify_token("secret-b", &token).is_err());
    }

    #[test]
    fn test_tampered_user_rejected() {
        let token = mint_token("secret", "alice", 60);
        let tampered = token.replacen("alice", "mallory", 1);
        assert!(verify_token("secret", &tampered).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(verify_token("secret", "not-a-token").is_err());
        assert!(verify_token("secret", "").is_err());
        assert!(verify_token("secret", "a.b.c").is_err());
    }
}
