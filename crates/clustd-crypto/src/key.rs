//! Per-message key schedule.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128 key length.
pub const KEY_LEN: usize = 16;

/// A single-use message key. Debug output is redacted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; KEY_LEN]);

impl MessageKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageKey(..)")
    }
}

/// Derive the key for message `counter`.
///
/// `ticket` is `None` until the channel handshake completes; after that it
/// must be the shared session ticket on both ends.
pub fn derive_message_key(secret: &[u8], counter: u32, ticket: Option<u32>) -> MessageKey {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(counter.to_be_bytes());
    if let Some(ticket) = ticket {
        hasher.update(ticket.to_be_bytes());
    }
    let mut digest = hasher.finalize();

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    digest.zeroize();
    MessageKey(key)
}
