//! GraphiVault - AEAD Encryption
//!
//! AES-256-GCM with caller-supplied nonces. Nonce policy lives in
//! [`super::nonce`]; this module only transforms bytes.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

use super::keys::KEY_LEN;

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// A 96-bit nonce
pub type NonceBytes = [u8; NONCE_LEN];

/// Opaque failure from [`open`]. Carries no detail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFailed;

/// Failure from [`seal`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealFailed(pub String);

/// Encrypt `plaintext`, returning ciphertext with the tag appended
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &NonceBytes,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SealFailed> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| SealFailed(e.to_string()))?;

    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| SealFailed(e.to_string()))
}

/// Decrypt and authenticate. Fails closed: no partial plaintext on any error.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &NonceBytes,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, OpenFailed> {
    if ciphertext.len() < TAG_LEN {
        return Err(OpenFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| OpenFailed)?;

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| OpenFailed)
}

/// Parse a stored nonce, rejecting the wrong length
pub fn nonce_from_slice(bytes: &[u8]) -> Option<NonceBytes> {
    bytes.try_into().ok()
}
