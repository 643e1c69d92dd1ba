//! Crypto error types.

use thiserror::Error;

/// Errors from sealing or opening a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Encryption failed (plaintext too large for the AEAD)
    #[error("encryption failed")]
    Encryption,

    /// Tag did not verify: wrong key, wrong counter, or tampered bytes
    #[error("authentication failed")]
    Authentication,
}
