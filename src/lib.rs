//! # GraphiVault
//!
//! Offline encrypted image vault: security core.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        VAULT (API)                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐   │
//! │  │   SESSION    │  │ RECORD STORE │  │   ROTATION     │   │
//! │  │ lock/unlock  │  │ AES-256-GCM  │  │ journal, rekey │   │
//! │  │ lockout/idle │  │ SQLite + fs  │  │                │   │
//! │  └──────┬───────┘  └──────┬───────┘  └───────┬────────┘   │
//! │         │                 │                  │            │
//! │  ┌──────┴─────────────────┴──────────────────┴─────────┐  │
//! │  │   CRYPTO: Argon2id / PBKDF2 → HKDF → epoch keys      │  │
//! │  │           counter nonces, durable reservations       │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐   │
//! │  │   MANIFEST   │  │  AUDIT TRAIL │  │   WATCHDOG     │   │
//! │  │  checksummed │  │  hash chain  │  │  idle timeout  │   │
//! │  └──────────────┘  └──────────────┘  └────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Image bytes and metadata sealed with AES-256-GCM, bound to record id and key epoch
//! - Master key exists only in memory while unlocked, zeroized on lock
//! - Nonces are counters; reserved blocks are persisted before use
//! - Failed unlocks lead to a lockout that skips key derivation entirely
//! - No plaintext on disk

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod manifest;
pub mod rotation;
pub mod secure_fs;
pub mod session;
pub mod store;
pub mod vault;
pub mod watchdog;

pub use audit::{AuditEntry, AuditEvent, ChainVerification};
pub use config::{SessionConfig, VaultConfig};
pub use crypto::{KdfAlgorithm, KdfParams, KeyDeriver, SecretPassword, StandardKdf};
pub use error::{VaultError, VaultResult};
pub use rotation::{RekeyControl, RekeyReport};
pub use session::{Clock, ManualClock, SessionPhase, SessionStatus, SystemClock};
pub use store::{DecryptedRecord, ImageMetadata, IntegrityReport, RecordSummary, StoreStats};
pub use vault::{Vault, VaultStatus};
pub use watchdog::IdleWatchdog;

/// GraphiVault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
