//! GraphiVault - Error Types

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // CONFIGURATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    // ═══════════════════════════════════════════════════════════════
    // VAULT ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Vault already initialized at: {0}")]
    AlreadyInitialized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Vault corrupted: {0}")]
    Corrupted(String),

    /// Deliberately ambiguous: a wrong password and a damaged verifier look the same.
    #[error("Wrong password or corrupted vault")]
    WrongPasswordOrCorrupt,

    #[error("Too many failed attempts - locked out until {until} ({retry_after_secs}s)")]
    LockedOut {
        until: DateTime<Utc>,
        retry_after_secs: u64,
    },

    #[error("Vault is not unlocked")]
    NotUnlocked,

    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Authentication failed for record {0} - tampered or sealed under another key")]
    AuthenticationFailed(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Nonce space exhausted for key epoch {0}")]
    NonceExhausted(u32),

    // ═══════════════════════════════════════════════════════════════
    // ROTATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("A key rotation is in progress")]
    RotationInProgress,

    #[error("Key rotation interrupted with {remaining} record(s) still under the old key")]
    RekeyInterrupted { remaining: usize },

    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VaultError {
    /// Errors that point at tampering or a key/data mismatch rather than misuse
    pub fn is_integrity_concern(&self) -> bool {
        matches!(
            self,
            VaultError::AuthenticationFailed(_) | VaultError::Corrupted(_)
        )
    }

    /// Check if this error came from the unlock gate
    pub fn is_unlock_rejection(&self) -> bool {
        matches!(
            self,
            VaultError::WrongPasswordOrCorrupt | VaultError::LockedOut { .. }
        )
    }

    /// Check if the caller may retry the same call unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::Io(_) | VaultError::Database(_) | VaultError::RekeyInterrupted { .. }
        )
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(VaultError::AuthenticationFailed("r1".into()).is_integrity_concern());
        assert!(!VaultError::NotUnlocked.is_integrity_concern());
        assert!(VaultError::WrongPasswordOrCorrupt.is_unlock_rejection());
        assert!(VaultError::RekeyInterrupted { remaining: 2 }.is_retryable());
        assert!(!VaultError::AuthenticationFailed("r1".into()).is_retryable());
    }
}
