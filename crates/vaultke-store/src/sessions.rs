//! Pairwise ratchet state persistence.
//!
//! One row per unordered user pair, keyed with the lexicographically
//! lower ID in `user_a_id`. Chain keys are stored base64-encoded; the
//! row is overwritten wholesale on every put so the cursors on disk
//! always describe a state the cipher has already committed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use vaultke_crypto::SessionState;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Order a pair so both (A,B) and (B,A) address the same row.
pub fn normalize_pair<'a>(user_a: &'a str, user_b: &'a str) -> (&'a str, &'a str) {
    if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    }
}

impl Database {
    pub fn get_session(&self, user_a: &str, user_b: &str) -> Result<SessionState> {
        let (lo, hi) = normalize_pair(user_a, user_b);
        let row: Option<(String, String, String, String, u32, u32)> = self
            .conn()
            .query_row(
                "SELECT id, shared_secret, sending_chain, receiving_chain,
                        message_number, received_number
                 FROM sessions WHERE user_a_id = ?1 AND user_b_id = ?2",
                params![lo, hi],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let (id, secret, sending, receiving, sent, received) = row.ok_or(StoreError::NotFound)?;

        Ok(SessionState {
            session_id: id,
            root_key: decode_key(&secret)?,
            send_chain: decode_key(&sending)?,
            recv_chain: decode_key(&receiving)?,
            send_count: sent,
            recv_count: received,
        })
    }

    /// Persist the session for a pair, inserting or overwriting. The
    /// row's `last_used` is refreshed; `created_at` survives updates.
    pub fn put_session(&self, user_a: &str, user_b: &str, state: &SessionState) -> Result<()> {
        let (lo, hi) = normalize_pair(user_a, user_b);
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO sessions
             (id, user_a_id, user_b_id, shared_secret, sending_chain, receiving_chain,
              message_number, received_number, created_at, last_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_a_id, user_b_id) DO UPDATE SET
               id = excluded.id,
               shared_secret = excluded.shared_secret,
               sending_chain = excluded.sending_chain,
               receiving_chain = excluded.receiving_chain,
               message_number = excluded.message_number,
               received_number = excluded.received_number,
               last_used = excluded.last_used",
            params![
                state.session_id,
                lo,
                hi,
                BASE64.encode(state.root_key),
                BASE64.encode(state.send_chain),
                BASE64.encode(state.recv_chain),
                state.send_count,
                state.recv_count,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    /// Erase every session between the pair. Later sends will have to
    /// re-establish from a fresh bundle.
    pub fn delete_sessions_between(&self, user_a: &str, user_b: &str) -> Result<usize> {
        let (lo, hi) = normalize_pair(user_a, user_b);
        let deleted = self.conn().execute(
            "DELETE FROM sessions WHERE user_a_id = ?1 AND user_b_id = ?2",
            params![lo, hi],
        )?;
        if deleted > 0 {
            tracing::info!(user_a = lo, user_b = hi, "session reset");
        }
        Ok(deleted)
    }
}

fn decode_key(value: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| StoreError::Corrupt("session key is not valid base64".into()))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("session key has the wrong length".into()))
}
