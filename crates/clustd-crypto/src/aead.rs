//! AES-128-GCM seal/open with a detached tag.

use aes_gcm::{
    Aes128Gcm, KeyInit, Nonce,
    aead::{AeadInPlace, generic_array::GenericArray},
};

use crate::{error::CryptoError, key::MessageKey};

/// IV length (96 bits).
pub const IV_LEN: usize = 12;

/// Tag length (128 bits).
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under `key` and `iv`.
///
/// Returns the detached tag and the ciphertext.
pub fn seal(
    key: &MessageKey,
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
) -> Result<([u8; TAG_LEN], Vec<u8>), CryptoError> {
    let cipher = Aes128Gcm::new(key.as_bytes().into());
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buffer)
        .map_err(|_| CryptoError::Encryption)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((tag_bytes, buffer))
}

/// Decrypt and authenticate.
pub fn open(
    key: &MessageKey,
    iv: &[u8; IV_LEN],
    tag: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(key.as_bytes().into());
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buffer, GenericArray::from_slice(tag))
        .map_err(|_| CryptoError::Authentication)?;
    Ok(buffer)
}
