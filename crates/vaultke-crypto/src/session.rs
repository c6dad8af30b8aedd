//! Pairwise session state and the hash-chain ratchet.
//!
//! One session row exists per unordered user pair, so the sending and
//! receiving cursors walk the same logical chain: the receive cursor
//! trails the send cursor and the message counter is shared across both
//! directions. Message keys are expanded from the chain position with
//! HKDF; advancing a cursor is `SHA-256(chain)`, which makes earlier keys
//! unrecoverable from later state.
//!
//! Receiving is split into a plan/commit pair: `plan_receive` derives all
//! keys without touching state, and `commit_receive` applies the cursor
//! move only after the caller has authenticated the envelope. A failed
//! decrypt therefore never advances the chain.

use zeroize::{Zeroize, ZeroizeOnDrop};

use vaultke_shared::constants::{KDF_INFO, SKIP_WINDOW};

use crate::error::{CryptoError, Result};
use crate::handshake::SessionKeys;
use crate::primitives::{hkdf_sha256, sha256};

/// Per-message key pair: one half for the AEAD, one for the MAC.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl MessageKeys {
    /// One key for both halves; the group fabric works this way.
    pub(crate) fn symmetric(key: [u8; 32]) -> Self {
        Self { enc: key, mac: key }
    }

    pub fn enc(&self) -> &[u8; 32] {
        &self.enc
    }

    pub fn mac(&self) -> &[u8; 32] {
        &self.mac
    }
}

impl std::fmt::Debug for MessageKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageKeys([REDACTED])")
    }
}

/// Mutable session state, persisted by the session store after every
/// successful send or receive.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionState {
    #[zeroize(skip)]
    pub session_id: String,
    pub root_key: [u8; 32],
    pub send_chain: [u8; 32],
    pub recv_chain: [u8; 32],
    #[zeroize(skip)]
    pub send_count: u32,
    #[zeroize(skip)]
    pub recv_count: u32,
}

impl SessionState {
    pub fn new(session_id: String, keys: &SessionKeys) -> Self {
        Self {
            session_id,
            root_key: *keys.root_key(),
            send_chain: *keys.chain_seed(),
            recv_chain: *keys.chain_seed(),
            send_count: 0,
            recv_count: 0,
        }
    }

    /// Keys for the next outbound message, at the current send cursor.
    pub fn sending_keys(&self) -> Result<MessageKeys> {
        derive_message_keys(&self.send_chain)
    }

    /// Advance the send cursor. Called only after the envelope has been
    /// assembled.
    pub fn advance_send(&mut self) {
        self.send_chain = sha256(&[&self.send_chain]);
        self.send_count += 1;
    }

    /// Derive keys for inbound message `number` without mutating state.
    ///
    /// Numbers below the receive cursor have already been consumed here
    /// and are the caller's skip cache's problem; numbers more than
    /// `SKIP_WINDOW` ahead are refused.
    pub fn plan_receive(&self, number: u32) -> Result<ReceivePlan> {
        if number < self.recv_count || number - self.recv_count > SKIP_WINDOW {
            return Err(CryptoError::OutOfOrder {
                expected: self.recv_count,
                got: number,
            });
        }

        let mut chain = self.recv_chain;
        let mut skipped = Vec::new();
        for n in self.recv_count..number {
            skipped.push((n, derive_message_keys(&chain)?));
            chain = sha256(&[&chain]);
        }

        let keys = derive_message_keys(&chain)?;
        let next_chain = sha256(&[&chain]);
        chain.zeroize();

        Ok(ReceivePlan {
            keys,
            skipped,
            next_chain,
            next_count: number + 1,
        })
    }

    /// Apply a successfully decrypted plan, returning the keys skipped
    /// over so the caller can cache them for late arrivals.
    pub fn commit_receive(&mut self, plan: ReceivePlan) -> Vec<(u32, MessageKeys)> {
        self.recv_chain = plan.next_chain;
        self.recv_count = plan.next_count;
        plan.skipped
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .finish()
    }
}

/// Outcome of `plan_receive`: everything needed to decrypt, nothing yet
/// committed.
pub struct ReceivePlan {
    pub(crate) keys: MessageKeys,
    skipped: Vec<(u32, MessageKeys)>,
    next_chain: [u8; 32],
    next_count: u32,
}

impl ReceivePlan {
    pub fn keys(&self) -> &MessageKeys {
        &self.keys
    }
}

fn derive_message_keys(chain: &[u8; 32]) -> Result<MessageKeys> {
    let mut out = [0u8; 64];
    hkdf_sha256(chain, None, KDF_INFO, &mut out)?;

    let mut enc = [0u8; 32];
    let mut mac = [0u8; 32];
    enc.copy_from_slice(&out[..32]);
    mac.copy_from_slice(&out[32..]);
    out.zeroize();

    Ok(MessageKeys { enc, mac })
}
