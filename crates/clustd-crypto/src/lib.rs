//! Cryptographic primitives for clustd secure channels.
//!
//! Every message gets its own key. The key for message number `n` in one
//! direction is the first 16 bytes of
//! `SHA-256(secret ‖ u32_be(n) ‖ [u32_be(ticket)])`, where the ticket suffix
//! only appears once the channel handshake has completed. Messages are sealed
//! with AES-128-GCM under a random 96-bit IV.
//!
//! # Security
//!
//! Confidentiality and authenticity rest entirely on the shared secret.
//! The ticket binds post-handshake keys to one session but is sent in the
//! clear inside the (secret-keyed) handshake, so it adds no strength against
//! someone holding the secret. Keys are derived on demand and zeroized on
//! drop; nothing here caches them.

pub mod aead;
pub mod error;
pub mod key;

pub use aead::{open, seal};
pub use error::CryptoError;
pub use key::{KEY_LEN, MessageKey, derive_message_key};
