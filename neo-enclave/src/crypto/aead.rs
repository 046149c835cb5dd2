//! AES-256-GCM with detached tags
//!
//! IV uniqueness per key is the caller's responsibility. Reusing an IV under
//! the same key breaks both confidentiality and authenticity, and nothing
//! here tracks or prevents it.

use crate::error::{TeeError, TeeResult};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use zeroize::{Zeroize, Zeroizing};

pub const AEAD_KEY_SIZE: usize = 32;
pub const AEAD_IV_SIZE: usize = 12;
pub const AEAD_TAG_SIZE: usize = 16;

/// Encrypt `plaintext`, authenticating `aad`; returns ciphertext and tag
pub fn aead_encrypt(
    key: &[u8; AEAD_KEY_SIZE],
    iv: &[u8; AEAD_IV_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> TeeResult<(Vec<u8>, [u8; AEAD_TAG_SIZE])> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TeeError::CryptoFailed(format!("aes-gcm: {}", e)))?;

    let mut buffer = plaintext.to_vec();
    match cipher.encrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buffer) {
        Ok(tag) => Ok((buffer, tag.into())),
        Err(_) => {
            buffer.zeroize();
            Err(TeeError::CryptoFailed("aes-gcm: encryption failed".to_string()))
        }
    }
}

/// Decrypt and authenticate. Fails closed: on any mismatch no plaintext
/// is returned and the scratch buffer is wiped.
pub fn aead_decrypt(
    key: &[u8; AEAD_KEY_SIZE],
    iv: &[u8; AEAD_IV_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
    tag: &[u8; AEAD_TAG_SIZE],
) -> TeeResult<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TeeError::CryptoFailed(format!("aes-gcm: {}", e)))?;

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| TeeError::CryptoFailed("aes-gcm: authentication failed".to_string()))?;
    Ok(buffer)
}
