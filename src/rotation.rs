//! GraphiVault - Key Rotation
//!
//! Rekey moves every record from key epoch `e` to `e + 1`. The candidate
//! manifest for `e + 1` is written to `rotation.journal` before any record
//! moves, so an interrupted run can be resumed with the same new password.
//! The vault manifest is only replaced once every record has been handled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::kdf::{KdfParams, KeyDeriver};
use crate::crypto::keys::{MasterKey, SecretPassword};
use crate::error::{VaultError, VaultResult};
use crate::manifest::VaultManifest;
use crate::secure_fs::SecureFs;
use crate::session::ExclusiveKey;
use crate::store::EncryptedRecordStore;

/// Journal file inside the vault root
pub const JOURNAL_FILE: &str = "rotation.journal";

// ═══════════════════════════════════════════════════════════════════════════
// JOURNAL
// ═══════════════════════════════════════════════════════════════════════════

/// Pending rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationJournal {
    pub from_epoch: u32,
    pub to_epoch: u32,
    pub started_at: DateTime<Utc>,
    /// Manifest that becomes current on commit
    pub candidate: VaultManifest,
    pub checksum: String,
}

impl RotationJournal {
    /// Derive the next-epoch key and build its candidate manifest
    pub fn begin(
        current: &VaultManifest,
        password: &SecretPassword,
        params: &KdfParams,
        deriver: &dyn KeyDeriver,
    ) -> VaultResult<(Self, MasterKey)> {
        let to_epoch = current
            .key_epoch
            .checked_add(1)
            .ok_or_else(|| VaultError::InvalidParameters("key epoch space exhausted".into()))?;

        let (mut candidate, key) = VaultManifest::seal_new(
            current.vault_id.clone(),
            to_epoch,
            current.created_at,
            password,
            params,
            deriver,
        )?;
        let started_at = Utc::now();
        candidate.rotated_at = Some(started_at);
        candidate.checksum = candidate.compute_checksum();

        let mut journal = Self {
            from_epoch: current.key_epoch,
            to_epoch,
            started_at,
            candidate,
            checksum: String::new(),
        };
        journal.checksum = journal.compute_checksum();

        Ok((journal, key))
    }

    /// `None` if no rotation is pending
    pub fn load(fs: &SecureFs) -> VaultResult<Option<Self>> {
        if !fs.exists(JOURNAL_FILE) {
            return Ok(None);
        }

        let data = fs.read_file(JOURNAL_FILE)?;
        let journal: Self = serde_json::from_slice(&data)
            .map_err(|e| VaultError::Corrupted(format!("rotation journal unreadable: {}", e)))?;

        if journal.checksum != journal.compute_checksum() {
            return Err(VaultError::Corrupted("rotation journal checksum mismatch".into()));
        }
        journal.candidate.validate()?;

        Ok(Some(journal))
    }

    pub fn save(&self, fs: &SecureFs) -> VaultResult<()> {
        let data = serde_json::to_vec_pretty(self)?;
        fs.write_file(JOURNAL_FILE, &data)
    }

    pub fn remove(fs: &SecureFs) -> VaultResult<()> {
        fs.shred_file(JOURNAL_FILE)
    }

    /// The new password must open the candidate verifier to resume
    pub fn open_candidate(
        &self,
        password: &SecretPassword,
        deriver: &dyn KeyDeriver,
    ) -> VaultResult<MasterKey> {
        self.candidate
            .unlock_with(password, deriver)
            .map_err(|e| match e {
                VaultError::WrongPasswordOrCorrupt => VaultError::RotationInProgress,
                other => other,
            })
    }

    fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"GRAPHIVAULT:JOURNAL:v1");
        hasher.update(self.from_epoch.to_be_bytes());
        hasher.update(self.to_epoch.to_be_bytes());
        hasher.update(self.started_at.timestamp().to_be_bytes());
        hasher.update(self.started_at.timestamp_subsec_nanos().to_be_bytes());
        hasher.update(self.candidate.checksum.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Remove a journal whose rotation already committed. Returns true if one was removed.
pub fn clear_stale_journal(fs: &SecureFs, manifest: &VaultManifest) -> VaultResult<bool> {
    match RotationJournal::load(fs)? {
        Some(journal) if journal.to_epoch <= manifest.key_epoch => {
            RotationJournal::remove(fs)?;
            log::info!("Removed completed rotation journal (epoch {})", journal.to_epoch);
            Ok(true)
        }
        _ => Ok(false),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTROL & REPORT
// ═══════════════════════════════════════════════════════════════════════════

/// Cancellation handle shared with a running rekey
#[derive(Debug, Clone, Default)]
pub struct RekeyControl {
    cancelled: Arc<AtomicBool>,
}

impl RekeyControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop before the next record
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed rekey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyReport {
    pub from_epoch: u32,
    pub to_epoch: u32,
    /// Records moved in this run
    pub rekeyed: usize,
    /// Records that failed authentication and stay under the old epoch
    pub failed: Vec<String>,
    /// True when this run continued a journal from an earlier one
    pub resumed: bool,
    pub orphans_swept: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// DRIVER
// ═══════════════════════════════════════════════════════════════════════════

/// Run (or resume) a rotation while holding exclusive key access
pub(crate) fn run_rekey(
    fs: &SecureFs,
    store: &EncryptedRecordStore,
    exclusive: &mut ExclusiveKey<'_>,
    password: &SecretPassword,
    params: &KdfParams,
    deriver: &dyn KeyDeriver,
    control: &RekeyControl,
) -> VaultResult<RekeyReport> {
    let manifest = VaultManifest::load(fs)?;
    let from_epoch = exclusive.key()?.epoch();
    if manifest.key_epoch != from_epoch {
        return Err(VaultError::Corrupted(format!(
            "session epoch {} does not match manifest epoch {}",
            from_epoch, manifest.key_epoch
        )));
    }

    let (journal, new_key, resumed) = match RotationJournal::load(fs)? {
        Some(journal) if journal.from_epoch == from_epoch => {
            let key = journal.open_candidate(password, deriver)?;
            log::info!("Resuming rotation to epoch {}", journal.to_epoch);
            (journal, key, true)
        }
        Some(journal) => {
            return Err(VaultError::Corrupted(format!(
                "rotation journal from epoch {} does not match vault epoch {}",
                journal.from_epoch, from_epoch
            )));
        }
        None => {
            let (journal, key) = RotationJournal::begin(&manifest, password, params, deriver)?;
            journal.save(fs)?;
            log::info!("Rotation to epoch {} started", journal.to_epoch);
            (journal, key, false)
        }
    };

    store.purge()?;

    let pending = store.ids_at_epoch(from_epoch)?;
    let mut rekeyed = 0;
    let mut failed = Vec::new();

    {
        let old_key = exclusive.key()?;
        for (done, record_id) in pending.iter().enumerate() {
            if control.is_cancelled() {
                let remaining = pending.len() - done;
                log::warn!("Rotation interrupted, {} record(s) remaining", remaining);
                return Err(VaultError::RekeyInterrupted { remaining });
            }

            match store.reseal_record(old_key, &new_key, record_id) {
                Ok(()) => rekeyed += 1,
                Err(e) if e.is_integrity_concern() => {
                    log::error!("Record {} kept under epoch {}: {}", record_id, from_epoch, e);
                    failed.push(record_id.clone());
                }
                Err(e) => return Err(e),
            }
            exclusive.touch();
        }
    }

    // Commit
    journal.candidate.save(fs)?;
    exclusive.replace(new_key);
    store.forget_epoch(from_epoch);
    RotationJournal::remove(fs)?;
    let orphans_swept = store.sweep_orphans()?;

    log::info!(
        "Rotation to epoch {} complete: {} moved, {} failed",
        journal.to_epoch,
        rekeyed,
        failed.len()
    );

    Ok(RekeyReport {
        from_epoch,
        to_epoch: journal.to_epoch,
        rekeyed,
        failed,
        resumed,
        orphans_swept,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::StandardKdf;
    use tempfile::tempdir;

    fn params() -> KdfParams {
        KdfParams::pbkdf2_sha512(1_000)
    }

    #[test]
    fn test_journal_roundtrip_and_password_gate() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let manifest = VaultManifest::create(&fs, &"old-pw".into(), &params(), &StandardKdf).unwrap();

        let (journal, key) =
            RotationJournal::begin(&manifest, &"new-pw".into(), &params(), &StandardKdf).unwrap();
        assert_eq!(journal.to_epoch, manifest.key_epoch + 1);
        assert_eq!(key.epoch(), journal.to_epoch);
        assert_eq!(journal.candidate.vault_id, manifest.vault_id);
        assert_ne!(journal.candidate.salt, manifest.salt);
        journal.save(&fs).unwrap();

        let loaded = RotationJournal::load(&fs).unwrap().unwrap();
        assert_eq!(loaded, journal);

        let reopened = loaded.open_candidate(&"new-pw".into(), &StandardKdf).unwrap();
        assert_eq!(reopened.expose(), key.expose());
        assert!(matches!(
            loaded.open_candidate(&"other-pw".into(), &StandardKdf),
            Err(VaultError::RotationInProgress)
        ));
    }

    #[test]
    fn test_tampered_journal_is_corrupted() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let manifest = VaultManifest::create(&fs, &"old-pw".into(), &params(), &StandardKdf).unwrap();
        let (mut journal, _) =
            RotationJournal::begin(&manifest, &"new-pw".into(), &params(), &StandardKdf).unwrap();

        journal.from_epoch = 7;
        journal.save(&fs).unwrap();
        assert!(matches!(RotationJournal::load(&fs), Err(VaultError::Corrupted(_))));
    }

    #[test]
    fn test_stale_journal_cleared() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let manifest = VaultManifest::create(&fs, &"old-pw".into(), &params(), &StandardKdf).unwrap();
        let (journal, _) =
            RotationJournal::begin(&manifest, &"new-pw".into(), &params(), &StandardKdf).unwrap();
        journal.save(&fs).unwrap();

        // Pending against the current manifest: kept
        assert!(!clear_stale_journal(&fs, &manifest).unwrap());

        // Committed manifest already at the target epoch: removed
        journal.candidate.save(&fs).unwrap();
        assert!(clear_stale_journal(&fs, &journal.candidate).unwrap());
        assert!(RotationJournal::load(&fs).unwrap().is_none());
    }

    #[test]
    fn test_control_cancel() {
        let control = RekeyControl::new();
        let shared = control.clone();
        assert!(!control.is_cancelled());
        shared.cancel();
        assert!(control.is_cancelled());
    }
}
