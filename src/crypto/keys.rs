//! GraphiVault - Key Material
//!
//! Scoped secret buffers and the in-memory master key. Key bytes live in a
//! heap box so moves never leave stray copies on the stack.

use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{VaultError, VaultResult};

/// Key length for AES-256
pub const KEY_LEN: usize = 32;

/// HKDF contexts for key separation
pub mod contexts {
    /// Context for the manifest verifier key
    pub const VERIFIER: &[u8] = b"graphivault:verifier:v1";

    /// Context for the record encryption key
    pub const RECORDS: &[u8] = b"graphivault:records:v1";
}

/// Password held for the duration of one call, wiped on every exit path
pub struct SecretPassword {
    inner: SecretVec<u8>,
}

impl SecretPassword {
    /// Take ownership of password bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: SecretVec::new(bytes),
        }
    }

    /// Expose the password bytes (use with caution)
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl From<&str> for SecretPassword {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

impl From<String> for SecretPassword {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

impl std::fmt::Debug for SecretPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretPassword([REDACTED])")
    }
}

/// Boxed key bytes, zeroized on drop
struct KeyBytes(Box<[u8; KEY_LEN]>);

impl KeyBytes {
    fn zeroed() -> Self {
        Self(Box::new([0u8; KEY_LEN]))
    }
}

impl Zeroize for KeyBytes {
    fn zeroize(&mut self) {
        (*self.0).zeroize();
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Raw KDF output, split into purpose keys before use
pub struct RootKey {
    bytes: KeyBytes,
}

impl RootKey {
    /// Run `fill` against a fresh zeroed buffer and wrap the result
    pub(crate) fn fill_with<F>(fill: F) -> VaultResult<Self>
    where
        F: FnOnce(&mut [u8]) -> VaultResult<()>,
    {
        let mut bytes = KeyBytes::zeroed();
        fill(&mut bytes.0[..])?;
        Ok(Self { bytes })
    }

    /// Derive the key that seals the manifest verifier
    pub fn verifier_key(&self) -> VaultResult<CipherKey> {
        expand(&self.bytes.0[..], contexts::VERIFIER).map(|bytes| CipherKey { bytes })
    }

    /// Derive the record key for a given epoch
    pub fn into_master_key(self, epoch: u32) -> VaultResult<MasterKey> {
        let bytes = expand(&self.bytes.0[..], contexts::RECORDS)?;
        Ok(MasterKey { bytes, epoch })
    }
}

impl ZeroizeOnDrop for RootKey {}

/// A short-lived AEAD key (verifier sealing)
pub struct CipherKey {
    bytes: KeyBytes,
}

impl CipherKey {
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes.0
    }
}

impl ZeroizeOnDrop for CipherKey {}

/// Record encryption key, owned by the session while unlocked
pub struct MasterKey {
    bytes: KeyBytes,
    epoch: u32,
}

impl MasterKey {
    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes.0
    }

    /// Key epoch this key seals under
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Wipe in place and return what is left of the buffer
    #[cfg(test)]
    pub(crate) fn wipe_and_inspect(mut self) -> [u8; KEY_LEN] {
        self.bytes.zeroize();
        *self.bytes.0
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN], epoch: u32) -> Self {
        Self {
            bytes: KeyBytes(Box::new(bytes)),
            epoch,
        }
    }
}

impl Zeroize for MasterKey {
    fn zeroize(&mut self) {
        self.bytes.zeroize();
    }
}

impl ZeroizeOnDrop for MasterKey {}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// HKDF-SHA256 expand into boxed key bytes
fn expand(ikm: &[u8], info: &[u8]) -> VaultResult<KeyBytes> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = KeyBytes::zeroed();

    hk.expand(info, &mut okm.0[..])
        .map_err(|e| VaultError::InvalidParameters(format!("HKDF expand: {}", e)))?;

    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(byte: u8) -> RootKey {
        RootKey::fill_with(|out| {
            out.fill(byte);
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_domain_separation() {
        let root = root(0x42);
        let verifier = root.verifier_key().unwrap();
        let master = root.into_master_key(1).unwrap();

        assert_ne!(verifier.expose(), master.expose());
        assert_ne!(master.expose(), &[0x42u8; KEY_LEN]);
        assert_eq!(master.epoch(), 1);
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let a = root(7).into_master_key(1).unwrap();
        let b = root(7).into_master_key(1).unwrap();
        assert_eq!(a.expose(), b.expose());
    }

    #[test]
    fn test_wipe_leaves_zeros() {
        let key = MasterKey::from_bytes([0xAB; KEY_LEN], 3);
        assert_eq!(key.wipe_and_inspect(), [0u8; KEY_LEN]);
    }

    #[test]
    fn test_password_debug_is_redacted() {
        let pw = SecretPassword::from("correct-horse");
        assert!(!format!("{:?}", pw).contains("horse"));
        assert_eq!(pw.expose(), b"correct-horse");
    }
}
