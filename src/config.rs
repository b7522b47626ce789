//! GraphiVault - Configuration
//!
//! Supplied by the host at initialization or startup. The core consumes it
//! but never writes it back; KDF parameters of an existing vault come from
//! its manifest, not from here.

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::crypto::kdf::KdfParams;
use crate::error::{VaultError, VaultResult};

/// Session policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lock after this many seconds without activity
    pub idle_timeout_secs: u64,
    /// Consecutive failed unlocks before lockout
    pub max_failed_attempts: u32,
    /// Lockout length in seconds
    pub lockout_duration_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            max_failed_attempts: 3,
            lockout_duration_secs: 15 * 60,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::seconds(self.idle_timeout_secs as i64)
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::seconds(self.lockout_duration_secs as i64)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.idle_timeout_secs == 0 {
            return Err(VaultError::InvalidParameters("idle timeout must be positive".into()));
        }
        if self.max_failed_attempts == 0 {
            return Err(VaultError::InvalidParameters(
                "max failed attempts must be at least 1".into(),
            ));
        }
        // Stay well inside chrono's Duration range
        let limit = i64::MAX as u64 / 1_000_000;
        if self.idle_timeout_secs > limit || self.lockout_duration_secs > limit {
            return Err(VaultError::InvalidParameters("duration too large".into()));
        }
        Ok(())
    }
}

/// Largest nonce block a config may ask for
pub const MAX_NONCE_BLOCK: u64 = 1 << 20;

/// Vault configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// KDF parameters for new vaults and rekeys
    pub kdf: KdfParams,
    /// Session policy
    pub session: SessionConfig,
    /// Write the hash-chained audit trail
    pub audit_enabled: bool,
    /// Nonce counters reserved per durable block
    pub nonce_block: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            session: SessionConfig::default(),
            audit_enabled: true,
            nonce_block: crate::crypto::nonce::DEFAULT_BLOCK,
        }
    }
}

impl VaultConfig {
    /// Load from a JSON file; missing keys fall back to defaults
    pub fn load<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| VaultError::InvalidParameters(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultResult<()> {
        self.kdf.validate()?;
        self.session.validate()?;
        if !(1..=MAX_NONCE_BLOCK).contains(&self.nonce_block) {
            return Err(VaultError::InvalidParameters(format!(
                "nonce block {} outside 1..={}",
                self.nonce_block, MAX_NONCE_BLOCK
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::KdfAlgorithm;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultConfig::default();
        config.validate().unwrap();
        assert_eq!(config.kdf.algorithm, KdfAlgorithm::Argon2id);
        assert_eq!(config.session.max_failed_attempts, 3);
        assert_eq!(config.session.idle_timeout(), Duration::minutes(30));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "kdf": { "algorithm": "pbkdf2-sha512", "iterations": 200000 },
                "session": { "max_failed_attempts": 5 }
            }"#,
        )
        .unwrap();

        let config = VaultConfig::load(&path).unwrap();
        assert_eq!(config.kdf, KdfParams::pbkdf2_sha512(200_000));
        assert_eq!(config.session.max_failed_attempts, 5);
        assert_eq!(config.session.lockout_duration_secs, 15 * 60);
        assert!(config.audit_enabled);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = VaultConfig::default();
        config.session.max_failed_attempts = 0;
        assert!(matches!(config.validate(), Err(VaultError::InvalidParameters(_))));

        let mut config = VaultConfig::default();
        config.kdf = KdfParams::pbkdf2_sha512(5);
        assert!(matches!(config.validate(), Err(VaultError::InvalidParameters(_))));
    }

    #[test]
    fn test_nonce_block_bounds() {
        let mut config = VaultConfig::default();
        config.nonce_block = MAX_NONCE_BLOCK;
        config.validate().unwrap();

        for block in [0, MAX_NONCE_BLOCK + 1, u64::MAX] {
            config.nonce_block = block;
            assert!(matches!(config.validate(), Err(VaultError::InvalidParameters(_))));
        }
    }
}
