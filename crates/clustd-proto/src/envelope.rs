//! AEAD envelope layout.
//!
//! ```text
//! ┌───────────────┬────────────────┬─────────────────────┐
//! │ IV (12 bytes) │ tag (16 bytes) │ ciphertext (n bytes)│
//! └───────────────┴────────────────┴─────────────────────┘
//! ```
//!
//! The tag precedes the ciphertext. This is the order peers on the wire
//! expect, so it must not change.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// IV length in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// Authentication tag length in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Fixed prefix of every envelope.
pub const HEADER_LEN: usize = IV_LEN + TAG_LEN;

/// A parsed envelope. Holds ciphertext only, never key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Random per-message IV
    pub iv: [u8; IV_LEN],
    /// AEAD authentication tag
    pub tag: [u8; TAG_LEN],
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.ciphertext.len());
        buf.put_slice(&self.iv);
        buf.put_slice(&self.tag);
        buf.put_slice(&self.ciphertext);
        buf.freeze()
    }

    /// Split wire bytes into IV, tag and ciphertext.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort { expected: HEADER_LEN, actual: bytes.len() });
        }
        let (iv_bytes, rest) = bytes.split_at(IV_LEN);
        let (tag_bytes, ciphertext) = rest.split_at(TAG_LEN);

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(iv_bytes);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(tag_bytes);

        Ok(Self { iv, tag, ciphertext: ciphertext.to_vec() })
    }
}
