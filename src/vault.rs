//! GraphiVault - Vault
//!
//! The core API. Composes manifest, session, record store, rotation and
//! audit trail. No key material crosses this boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audit::{self, hash_identifier, AuditDetail, AuditEntry, AuditEvent, AuditTrail, ChainVerification};
use crate::config::VaultConfig;
use crate::crypto::kdf::{KeyDeriver, StandardKdf};
use crate::crypto::keys::SecretPassword;
use crate::error::{VaultError, VaultResult};
use crate::manifest::VaultManifest;
use crate::rotation::{self, RekeyControl, RekeyReport, JOURNAL_FILE};
use crate::secure_fs::SecureFs;
use crate::session::{
    Clock, ExclusiveKey, KeyGuard, SessionController, SessionPhase, SessionStatus, SystemClock,
};
use crate::store::{
    DecryptedRecord, EncryptedRecordStore, ImageMetadata, IntegrityReport, RecordSummary,
    StoreStats,
};

/// Vault status for hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStatus {
    pub initialized: bool,
    pub vault_id: Option<String>,
    /// Epoch recorded in the manifest
    pub manifest_epoch: Option<u32>,
    pub rotation_pending: bool,
    pub session: SessionStatus,
}

/// GraphiVault - Main entry point
pub struct Vault {
    /// Vault root path
    root: PathBuf,
    config: VaultConfig,
    fs: SecureFs,
    session: SessionController,
    store: EncryptedRecordStore,
    audit: Option<AuditTrail>,
    /// Serializes initialization
    admin: Mutex<()>,
}

impl Vault {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Open the vault at `path`, creating the directory if needed
    pub fn open<P: AsRef<Path>>(path: P, config: VaultConfig) -> VaultResult<Self> {
        Self::with_parts(path, config, Arc::new(SystemClock), Arc::new(StandardKdf))
    }

    /// Open with an explicit clock and key deriver
    pub fn with_parts<P: AsRef<Path>>(
        path: P,
        config: VaultConfig,
        clock: Arc<dyn Clock>,
        deriver: Arc<dyn KeyDeriver>,
    ) -> VaultResult<Self> {
        config.validate()?;

        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let fs = SecureFs::new(&root);
        let initialized = VaultManifest::exists(&fs);
        let store = EncryptedRecordStore::open(&root, config.nonce_block)?;
        let audit = if config.audit_enabled {
            Some(AuditTrail::open(&root)?)
        } else {
            None
        };

        if initialized {
            store.sweep_orphans()?;
        }

        let session = SessionController::new(config.session.clone(), clock, deriver, initialized);

        log::info!("Vault opened at {} (initialized: {})", root.display(), initialized);

        Ok(Self {
            root,
            config,
            fs,
            session,
            store,
            audit,
            admin: Mutex::new(()),
        })
    }

    /// Create the manifest. The session stays Locked afterwards.
    pub fn initialize_vault(&self, password: &SecretPassword) -> VaultResult<String> {
        let _admin = self.admin.lock();

        if password.is_empty() {
            return Err(VaultError::InvalidParameters("password must not be empty".into()));
        }

        let manifest =
            VaultManifest::create(&self.fs, password, &self.config.kdf, self.session.deriver())?;
        self.session.mark_initialized();

        self.audit(
            AuditEvent::VaultInitialized,
            audit::detail([
                ("vault", hash_identifier(&manifest.vault_id)),
                ("kdf", format!("{:?}", manifest.kdf.algorithm)),
            ]),
        );

        Ok(manifest.vault_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UNLOCK / LOCK
    // ═══════════════════════════════════════════════════════════════════════

    /// Unlock with the master password. On an unlocked vault this checks the
    /// password again, and a wrong one counts toward the lockout.
    pub fn unlock(&self, password: &SecretPassword) -> VaultResult<()> {
        let before = self.session.status();
        self.audit_idle_locks();
        match before.state {
            SessionPhase::Uninitialized => {
                return Err(VaultError::NotFound(format!(
                    "no vault at {}",
                    self.root.display()
                )));
            }
            SessionPhase::LockedOut => {
                self.audit(AuditEvent::UnlockRejected, AuditDetail::new());
                return Err(VaultError::LockedOut {
                    until: before.lockout_until.unwrap_or_else(|| self.session.clock().now()),
                    retry_after_secs: before.retry_after_secs.unwrap_or(0),
                });
            }
            SessionPhase::Locked | SessionPhase::Unlocked => {}
        }

        // Damage is not told apart from a wrong password, and costs no attempt
        let manifest = match VaultManifest::load(&self.fs) {
            Ok(manifest) => manifest,
            Err(e) => {
                log::error!("Manifest rejected during unlock: {}", e);
                self.audit(
                    AuditEvent::UnlockFailed,
                    audit::detail([("reason", "manifest".to_string())]),
                );
                return Err(VaultError::WrongPasswordOrCorrupt);
            }
        };

        if let Err(e) = rotation::clear_stale_journal(&self.fs, &manifest) {
            log::warn!("Could not inspect rotation journal: {}", e);
        }

        let result = self.session.unlock(password, &manifest);
        self.audit_idle_locks();

        match result {
            Ok(()) => {
                self.audit(
                    AuditEvent::UnlockSucceeded,
                    audit::detail([("epoch", manifest.key_epoch.to_string())]),
                );
                Ok(())
            }
            Err(e @ VaultError::LockedOut { .. }) => {
                self.audit(AuditEvent::LockoutStarted, AuditDetail::new());
                Err(e)
            }
            Err(VaultError::WrongPasswordOrCorrupt) => {
                let status = self.session.status();
                self.audit(
                    AuditEvent::UnlockFailed,
                    audit::detail([("failed_attempts", status.failed_attempts.to_string())]),
                );
                Err(VaultError::WrongPasswordOrCorrupt)
            }
            Err(e) => {
                log::error!("Unlock failed: {}", e);
                Err(VaultError::WrongPasswordOrCorrupt)
            }
        }
    }

    /// Zeroize the key and lock. Idempotent.
    pub fn lock(&self) {
        if self.session.lock() {
            self.audit(AuditEvent::Locked, AuditDetail::new());
        }
    }

    /// Lock if idle for longer than the timeout. Returns true if it locked.
    pub fn check_timeout(&self) -> bool {
        let locked = self.session.check_timeout();
        self.audit_idle_locks();
        locked
    }

    pub fn get_status(&self) -> VaultStatus {
        let session = self.session.status();
        self.audit_idle_locks();
        let manifest = VaultManifest::load(&self.fs).ok();

        VaultStatus {
            initialized: session.state != SessionPhase::Uninitialized,
            vault_id: manifest.as_ref().map(|m| m.vault_id.clone()),
            manifest_epoch: manifest.as_ref().map(|m| m.key_epoch),
            rotation_pending: self.fs.exists(JOURNAL_FILE),
            session,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_unlocked()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECORD OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt and store image bytes with metadata
    pub fn add_record(&self, data: &[u8], metadata: ImageMetadata) -> VaultResult<String> {
        let key = self.read_key()?;
        let record_id = self.store.add(&key, data, metadata)?;
        drop(key);

        self.session.touch();
        self.audit(
            AuditEvent::RecordAdded,
            audit::detail([
                ("record", hash_identifier(&record_id)),
                ("bytes", data.len().to_string()),
            ]),
        );
        Ok(record_id)
    }

    /// Decrypt a record
    pub fn get_record(&self, record_id: &str) -> VaultResult<DecryptedRecord> {
        let key = self.read_key()?;
        let result = self.store.get(&key, record_id);
        drop(key);

        self.after_read(record_id, result)
    }

    pub fn get_metadata(&self, record_id: &str) -> VaultResult<ImageMetadata> {
        let key = self.read_key()?;
        let result = self.store.get_metadata(&key, record_id);
        drop(key);

        self.after_read(record_id, result)
    }

    pub fn update_metadata(&self, record_id: &str, metadata: &ImageMetadata) -> VaultResult<()> {
        let key = self.read_key()?;
        let result = self.store.update_metadata(&key, record_id, metadata);
        drop(key);

        self.after_read(record_id, result)?;
        self.audit(
            AuditEvent::MetadataUpdated,
            audit::detail([("record", hash_identifier(record_id))]),
        );
        Ok(())
    }

    /// Delete a record, shredding its payload
    pub fn delete_record(&self, record_id: &str) -> VaultResult<()> {
        let key = self.read_key()?;
        self.store.delete(record_id)?;
        drop(key);

        self.session.touch();
        self.audit(
            AuditEvent::RecordDeleted,
            audit::detail([("record", hash_identifier(record_id))]),
        );
        Ok(())
    }

    pub fn list_records(&self) -> VaultResult<Vec<RecordSummary>> {
        let key = self.read_key()?;
        let summaries = self.store.list(&key)?;
        drop(key);

        for summary in summaries.iter().filter(|s| !s.integrity_ok) {
            self.audit(
                AuditEvent::IntegrityFailure,
                audit::detail([("record", hash_identifier(&summary.record_id))]),
            );
        }

        self.session.touch();
        Ok(summaries)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MAINTENANCE
    // ═══════════════════════════════════════════════════════════════════════

    /// Finish interrupted deletes. Waits for in-flight record operations,
    /// since it sweeps their temp files.
    pub fn purge(&self) -> VaultResult<usize> {
        let exclusive = self.exclusive()?;
        let purged = self.store.purge()?;
        drop(exclusive);

        self.session.touch();
        if purged > 0 {
            self.audit(
                AuditEvent::RecordsPurged,
                audit::detail([("count", purged.to_string())]),
            );
        }
        Ok(purged)
    }

    /// Open every record and look for payload files no row points at
    pub fn verify_integrity(&self) -> VaultResult<IntegrityReport> {
        let manifest = VaultManifest::load(&self.fs)?;

        let key = self.read_key()?;
        if manifest.key_epoch != key.epoch() {
            return Err(VaultError::Corrupted(format!(
                "manifest epoch {} does not match session epoch {}",
                manifest.key_epoch,
                key.epoch()
            )));
        }
        let report = self.store.verify(&key)?;
        drop(key);

        self.session.touch();
        for record_id in &report.failed {
            self.audit(
                AuditEvent::IntegrityFailure,
                audit::detail([("record", hash_identifier(record_id))]),
            );
        }
        if !report.is_healthy() {
            log::warn!(
                "Integrity check: {} failed, {} stale, {} orphan file(s)",
                report.failed.len(),
                report.stale.len(),
                report.orphans.len()
            );
        }
        Ok(report)
    }

    /// Records left under an older key epoch by a rekey
    pub fn stale_records(&self) -> VaultResult<Vec<String>> {
        let key = self.read_key()?;
        let stale = self.store.stale_records(key.epoch())?;
        drop(key);

        self.session.touch();
        Ok(stale)
    }

    pub fn stats(&self) -> VaultResult<StoreStats> {
        let key = self.read_key()?;
        let stats = self.store.stats(key.epoch())?;
        drop(key);

        self.session.touch();
        Ok(stats)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REKEY
    // ═══════════════════════════════════════════════════════════════════════

    /// Move every record under a key derived from `new_password`
    pub fn rekey(&self, new_password: &SecretPassword) -> VaultResult<RekeyReport> {
        self.rekey_with(new_password, &RekeyControl::new())
    }

    /// Rekey with a cancellation handle
    pub fn rekey_with(
        &self,
        new_password: &SecretPassword,
        control: &RekeyControl,
    ) -> VaultResult<RekeyReport> {
        if new_password.is_empty() {
            return Err(VaultError::InvalidParameters("password must not be empty".into()));
        }

        let mut exclusive = self.exclusive()?;
        self.audit(AuditEvent::RekeyStarted, AuditDetail::new());

        let result = rotation::run_rekey(
            &self.fs,
            &self.store,
            &mut exclusive,
            new_password,
            &self.config.kdf,
            self.session.deriver(),
            control,
        );
        drop(exclusive);

        match &result {
            Ok(report) => self.audit(
                AuditEvent::RekeyCompleted,
                audit::detail([
                    ("from_epoch", report.from_epoch.to_string()),
                    ("to_epoch", report.to_epoch.to_string()),
                    ("rekeyed", report.rekeyed.to_string()),
                    ("failed", report.failed.len().to_string()),
                ]),
            ),
            Err(VaultError::RekeyInterrupted { remaining }) => self.audit(
                AuditEvent::RekeyInterrupted,
                audit::detail([("remaining", remaining.to_string())]),
            ),
            Err(e) => log::error!("Rekey failed: {}", e),
        }

        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // AUDIT
    // ═══════════════════════════════════════════════════════════════════════

    /// Newest `limit` audit entries, oldest first. Empty if auditing is off.
    pub fn audit_events(&self, limit: usize) -> VaultResult<Vec<AuditEntry>> {
        match &self.audit {
            Some(trail) => trail.recent(limit),
            None => Ok(Vec::new()),
        }
    }

    /// Verify the audit hash chain. `None` if auditing is off.
    pub fn verify_audit(&self) -> VaultResult<Option<ChainVerification>> {
        self.audit.as_ref().map(|trail| trail.verify_chain()).transpose()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ACCESSORS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    /// Shared key access; idle locks it triggers are audited
    fn read_key(&self) -> VaultResult<KeyGuard<'_>> {
        self.session.read_key().map_err(|e| {
            self.audit_idle_locks();
            e
        })
    }

    fn exclusive(&self) -> VaultResult<ExclusiveKey<'_>> {
        self.session.exclusive().map_err(|e| {
            self.audit_idle_locks();
            e
        })
    }

    /// Touch on success, record integrity failures
    fn after_read<T>(&self, record_id: &str, result: VaultResult<T>) -> VaultResult<T> {
        match &result {
            Ok(_) => self.session.touch(),
            Err(e) if e.is_integrity_concern() => {
                log::error!("Integrity failure on record {}: {}", record_id, e);
                self.audit(
                    AuditEvent::IntegrityFailure,
                    audit::detail([("record", hash_identifier(record_id))]),
                );
            }
            Err(_) => {}
        }
        result
    }

    fn audit(&self, event: AuditEvent, detail: AuditDetail) {
        self.audit_at(event, detail, self.session.clock().now());
    }

    fn audit_at(&self, event: AuditEvent, detail: AuditDetail, timestamp: DateTime<Utc>) {
        if let Some(trail) = &self.audit {
            if let Err(e) = trail.record(event, detail, timestamp) {
                log::error!("Audit write failed for {:?}: {}", event, e);
            }
        }
    }

    /// Record idle-timeout locks the session took on its own
    fn audit_idle_locks(&self) {
        for locked_at in self.session.take_idle_locks() {
            self.audit_at(AuditEvent::IdleTimeout, AuditDetail::new(), locked_at);
        }
    }
}
