//! GraphiVault - Password Key Derivation
//!
//! Argon2id (default) or PBKDF2-HMAC-SHA512. Parameters travel with the
//! manifest so they can be raised later without breaking existing vaults.

use argon2::{Algorithm, Argon2, Params, Version};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha512;

use super::keys::{RootKey, SecretPassword};
use crate::error::{VaultError, VaultResult};

/// Salt length generated for new vaults
pub const SALT_LEN: usize = 32;

/// Shortest salt accepted from a manifest
pub const MIN_SALT_LEN: usize = 16;

/// Supported bounds
pub mod bounds {
    pub const ARGON2_MIN_MEMORY_KIB: u32 = 8 * 1024;
    pub const ARGON2_MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;
    pub const ARGON2_MAX_PASSES: u32 = 16;
    pub const ARGON2_MAX_PARALLELISM: u32 = 16;
    pub const PBKDF2_MIN_ITERATIONS: u32 = 1_000;
    pub const PBKDF2_MAX_ITERATIONS: u32 = 10_000_000;
}

/// KDF algorithm recorded in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    Argon2id,
    Pbkdf2Sha512,
}

impl KdfAlgorithm {
    /// Stable tag used in the manifest checksum
    pub fn tag(&self) -> u8 {
        match self {
            KdfAlgorithm::Argon2id => 1,
            KdfAlgorithm::Pbkdf2Sha512 => 2,
        }
    }
}

/// KDF cost parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    /// Argon2 passes (time cost) or PBKDF2 rounds
    pub iterations: u32,
    /// Argon2 memory in KiB (ignored by PBKDF2)
    #[serde(default)]
    pub memory_kib: u32,
    /// Argon2 lanes (ignored by PBKDF2)
    #[serde(default)]
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::argon2id(64 * 1024, 3, 2)
    }
}

impl KdfParams {
    pub fn argon2id(memory_kib: u32, passes: u32, parallelism: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            iterations: passes,
            memory_kib,
            parallelism,
        }
    }

    pub fn pbkdf2_sha512(iterations: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha512,
            iterations,
            memory_kib: 0,
            parallelism: 0,
        }
    }

    /// Reject parameters outside the supported envelope
    pub fn validate(&self) -> VaultResult<()> {
        use bounds::*;

        match self.algorithm {
            KdfAlgorithm::Argon2id => {
                if !(ARGON2_MIN_MEMORY_KIB..=ARGON2_MAX_MEMORY_KIB).contains(&self.memory_kib) {
                    return Err(VaultError::InvalidParameters(format!(
                        "argon2 memory {} KiB outside {}..={}",
                        self.memory_kib, ARGON2_MIN_MEMORY_KIB, ARGON2_MAX_MEMORY_KIB
                    )));
                }
                if !(1..=ARGON2_MAX_PASSES).contains(&self.iterations) {
                    return Err(VaultError::InvalidParameters(format!(
                        "argon2 passes {} outside 1..={}",
                        self.iterations, ARGON2_MAX_PASSES
                    )));
                }
                if !(1..=ARGON2_MAX_PARALLELISM).contains(&self.parallelism) {
                    return Err(VaultError::InvalidParameters(format!(
                        "argon2 parallelism {} outside 1..={}",
                        self.parallelism, ARGON2_MAX_PARALLELISM
                    )));
                }
            }
            KdfAlgorithm::Pbkdf2Sha512 => {
                if !(PBKDF2_MIN_ITERATIONS..=PBKDF2_MAX_ITERATIONS).contains(&self.iterations) {
                    return Err(VaultError::InvalidParameters(format!(
                        "pbkdf2 iterations {} outside {}..={}",
                        self.iterations, PBKDF2_MIN_ITERATIONS, PBKDF2_MAX_ITERATIONS
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Derive the root key from a password. Deterministic in all three inputs.
pub fn derive_key(password: &[u8], salt: &[u8], params: &KdfParams) -> VaultResult<RootKey> {
    params.validate()?;

    if salt.len() < MIN_SALT_LEN {
        return Err(VaultError::InvalidParameters(format!(
            "salt of {} bytes is shorter than {}",
            salt.len(),
            MIN_SALT_LEN
        )));
    }

    RootKey::fill_with(|out| match params.algorithm {
        KdfAlgorithm::Argon2id => {
            let argon_params = Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism,
                Some(out.len()),
            )
            .map_err(|e| VaultError::InvalidParameters(format!("argon2 params: {}", e)))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
                .hash_password_into(password, salt, out)
                .map_err(|e| VaultError::InvalidParameters(format!("argon2: {}", e)))
        }
        KdfAlgorithm::Pbkdf2Sha512 => {
            pbkdf2_hmac::<Sha512>(password, salt, params.iterations, out);
            Ok(())
        }
    })
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    use rand::RngCore;
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Seam between the session and the KDF, so derivations can be observed
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, password: &SecretPassword, salt: &[u8], params: &KdfParams)
        -> VaultResult<RootKey>;
}

/// The production deriver
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardKdf;

impl KeyDeriver for StandardKdf {
    fn derive(
        &self,
        password: &SecretPassword,
        salt: &[u8],
        params: &KdfParams,
    ) -> VaultResult<RootKey> {
        derive_key(password.expose(), salt, params)
    }
}
