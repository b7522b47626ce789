//! GraphiVault - Encrypted Record Store
//!
//! Each record is two AEAD ciphertexts under the session key: the payload in
//! `data/<id>.<epoch>.enc` and the metadata JSON in its table row. Both carry
//! the record id, part and key epoch as associated data, so a ciphertext moved
//! to another row, part or epoch fails authentication.
//!
//! The payload file is written first; inserting the row is what makes a
//! record visible. A crash in between leaves an orphan file that the next
//! sweep removes.

mod table;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::aead::{self, nonce_from_slice};
use crate::crypto::keys::MasterKey;
use crate::crypto::nonce::NonceSequence;
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::SecureFs;

pub use table::{RecordRow, RecordTable, DB_FILE};
use table::ResealedRow;

/// Payload directory inside the vault root
pub const DATA_DIR: &str = "data";

/// Payload file suffix
const PAYLOAD_SUFFIX: &str = ".enc";

// ═══════════════════════════════════════════════════════════════════════════
// METADATA
// ═══════════════════════════════════════════════════════════════════════════

/// Image metadata, stored encrypted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Original file name
    #[serde(default)]
    pub name: Option<String>,
    /// MIME type; sniffed from the payload when not given
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form key/value pairs
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ImageMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Detect MIME type from magic bytes
pub fn detect_mime(data: &[u8]) -> &'static str {
    if data.len() < 8 {
        return "application/octet-stream";
    }

    match &data[0..8] {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] => "image/png",
        [0x47, 0x49, 0x46, 0x38, ..] => "image/gif",
        [0x42, 0x4D, ..] => "image/bmp",
        [0x52, 0x49, 0x46, 0x46, ..] => {
            if data.len() >= 12 && &data[8..12] == b"WEBP" {
                "image/webp"
            } else {
                "application/octet-stream"
            }
        }
        _ => {
            // HEIC/HEIF/AVIF
            if data.len() >= 12 && &data[4..8] == b"ftyp" {
                match &data[8..12] {
                    b"heic" | b"heix" => return "image/heic",
                    b"mif1" => return "image/heif",
                    b"avif" => return "image/avif",
                    _ => {}
                }
            }
            "application/octet-stream"
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RESULT TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// A decrypted record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRecord {
    pub record_id: String,
    pub data: Vec<u8>,
    pub metadata: ImageMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing entry. `metadata` is `None` when the record failed authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub record_id: String,
    pub key_epoch: u32,
    pub plaintext_len: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<ImageMetadata>,
    pub integrity_ok: bool,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub records: u64,
    pub tombstoned: u64,
    pub stale: u64,
    pub plaintext_bytes: u64,
    pub stored_bytes: u64,
}

/// Whole-store integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Records opened under the session key
    pub checked: usize,
    /// Records whose payload or metadata does not authenticate
    pub failed: Vec<String>,
    /// Records still under an older key epoch
    pub stale: Vec<String>,
    /// Records already moved by a rotation that has not committed
    pub pending: Vec<String>,
    /// Payload files no row points at
    pub orphans: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty() && self.stale.is_empty() && self.orphans.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Part {
    Payload,
    Metadata,
}

impl Part {
    fn label(self) -> &'static [u8] {
        match self {
            Part::Payload => b"payload",
            Part::Metadata => b"metadata",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypted Record Store
pub struct EncryptedRecordStore {
    fs: SecureFs,
    table: RecordTable,
    nonces: NonceSequence,
}

impl EncryptedRecordStore {
    /// Open or create the store under a vault root
    pub fn open(root: &Path, nonce_block: u64) -> VaultResult<Self> {
        std::fs::create_dir_all(root.join(DATA_DIR))?;
        let table = RecordTable::open(&root.join(DB_FILE))?;

        Ok(Self {
            fs: SecureFs::new(root),
            table,
            nonces: NonceSequence::new(nonce_block),
        })
    }

    /// Seal and persist a new record
    pub fn add(&self, key: &MasterKey, data: &[u8], metadata: ImageMetadata) -> VaultResult<String> {
        let mut metadata = metadata;
        if metadata.mime_type.is_none() {
            metadata.mime_type = Some(detect_mime(data).to_string());
        }

        let record_id = Uuid::new_v4().to_string();
        let epoch = key.epoch();

        let payload_nonce = self.nonces.next(epoch, &self.table)?;
        let metadata_nonce = self.nonces.next(epoch, &self.table)?;

        let payload = seal(key, &payload_nonce, data, &record_aad(&record_id, Part::Payload, epoch))?;
        let metadata_json = Zeroizing::new(serde_json::to_vec(&metadata)?);
        let metadata_ciphertext = seal(
            key,
            &metadata_nonce,
            &metadata_json,
            &record_aad(&record_id, Part::Metadata, epoch),
        )?;

        let path = payload_path(&record_id, epoch);
        self.fs.write_file(&path, &payload)?;

        let now = Utc::now();
        let row = RecordRow {
            record_id: record_id.clone(),
            key_epoch: epoch,
            payload_nonce: payload_nonce.to_vec(),
            metadata_nonce: metadata_nonce.to_vec(),
            metadata_ciphertext,
            plaintext_len: data.len() as u64,
            created_at: now,
            updated_at: now,
            tombstoned: false,
        };

        if let Err(e) = self.table.insert(&row) {
            if let Err(shred) = self.fs.shred_file(&path) {
                log::warn!("Could not remove payload of failed insert {}: {}", record_id, shred);
            }
            return Err(e);
        }

        log::info!("Record {} added ({} bytes)", record_id, data.len());
        Ok(record_id)
    }

    /// Decrypt payload and metadata
    pub fn get(&self, key: &MasterKey, record_id: &str) -> VaultResult<DecryptedRecord> {
        let row = self.live_row(record_id)?;
        check_epoch(&row, key)?;

        let data = self.read_payload(key, &row)?;
        let metadata = self.open_metadata(key, &row)?;

        Ok(DecryptedRecord {
            record_id: row.record_id,
            data,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    /// Decrypt metadata only
    pub fn get_metadata(&self, key: &MasterKey, record_id: &str) -> VaultResult<ImageMetadata> {
        let row = self.live_row(record_id)?;
        check_epoch(&row, key)?;
        self.open_metadata(key, &row)
    }

    /// Re-seal metadata under a fresh nonce; the payload is untouched
    pub fn update_metadata(
        &self,
        key: &MasterKey,
        record_id: &str,
        metadata: &ImageMetadata,
    ) -> VaultResult<()> {
        let row = self.live_row(record_id)?;
        check_epoch(&row, key)?;

        // Refuse to overwrite metadata that no longer authenticates
        self.open_metadata(key, &row)?;

        let epoch = key.epoch();
        let nonce = self.nonces.next(epoch, &self.table)?;
        let json = Zeroizing::new(serde_json::to_vec(metadata)?);
        let ciphertext = seal(key, &nonce, &json, &record_aad(record_id, Part::Metadata, epoch))?;

        if !self
            .table
            .update_metadata(record_id, epoch, &nonce, &ciphertext, Utc::now())?
        {
            return Err(VaultError::NotFound(record_id.to_string()));
        }

        log::debug!("Metadata of {} updated", record_id);
        Ok(())
    }

    /// Tombstone, shred the payload, drop the row. A failed shred keeps the
    /// tombstone so `purge` can finish later.
    pub fn delete(&self, record_id: &str) -> VaultResult<()> {
        if !self.table.set_tombstone(record_id)? {
            return Err(VaultError::NotFound(record_id.to_string()));
        }

        match self.shred_payloads(record_id) {
            Ok(()) => {
                self.table.remove(record_id)?;
                log::info!("Record {} deleted", record_id);
            }
            Err(e) => {
                log::warn!("Record {} tombstoned, payload shred deferred: {}", record_id, e);
            }
        }

        Ok(())
    }

    /// Finish deletes of tombstoned records and clear stray temp files.
    /// No `add` may run concurrently: its temp file would be swept.
    pub fn purge(&self) -> VaultResult<usize> {
        let mut purged = 0;

        for record_id in self.table.tombstoned()? {
            match self.shred_payloads(&record_id) {
                Ok(()) => {
                    self.table.remove(&record_id)?;
                    purged += 1;
                }
                Err(e) => log::warn!("Purge of {} failed: {}", record_id, e),
            }
        }

        let temps = self.fs.sweep_temp_files(DATA_DIR)?;
        if purged > 0 || temps > 0 {
            log::info!("Purged {} tombstoned record(s), {} temp file(s)", purged, temps);
        }

        Ok(purged)
    }

    /// Summaries of every live record. Records that fail authentication are
    /// reported with `integrity_ok = false`.
    pub fn list(&self, key: &MasterKey) -> VaultResult<Vec<RecordSummary>> {
        let mut summaries = Vec::new();

        for row in self.table.all()? {
            if row.tombstoned {
                continue;
            }

            let metadata = match check_epoch(&row, key).and_then(|_| self.open_metadata(key, &row)) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    log::warn!("Record {} failed integrity check: {}", row.record_id, e);
                    None
                }
            };

            summaries.push(RecordSummary {
                integrity_ok: metadata.is_some(),
                metadata,
                record_id: row.record_id,
                key_epoch: row.key_epoch,
                plaintext_len: row.plaintext_len,
                created_at: row.created_at,
                updated_at: row.updated_at,
            });
        }

        Ok(summaries)
    }

    /// Open every live record under `key` and list payload files without a row
    pub fn verify(&self, key: &MasterKey) -> VaultResult<IntegrityReport> {
        use std::cmp::Ordering;

        let mut report = IntegrityReport::default();
        let rows = self.table.all()?;

        for row in rows.iter().filter(|row| !row.tombstoned) {
            match row.key_epoch.cmp(&key.epoch()) {
                Ordering::Less => report.stale.push(row.record_id.clone()),
                Ordering::Greater => report.pending.push(row.record_id.clone()),
                Ordering::Equal => {
                    let opened = self
                        .read_payload(key, row)
                        .and_then(|_| self.open_metadata(key, row));
                    match opened {
                        Ok(_) => report.checked += 1,
                        Err(VaultError::NotFound(_)) => {}
                        Err(e) if e.is_integrity_concern() => {
                            log::error!("Record {} failed verification: {}", row.record_id, e);
                            report.failed.push(row.record_id.clone());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        for name in self.fs.list_dir(DATA_DIR)? {
            let owned = match parse_payload_name(&name) {
                Some((record_id, epoch)) => {
                    rows.iter()
                        .any(|row| row.record_id == record_id && row.key_epoch == epoch)
                        || self
                            .table
                            .get(record_id)?
                            .map_or(false, |row| row.key_epoch == epoch)
                }
                None => false,
            };
            if !owned {
                report.orphans.push(name);
            }
        }

        Ok(report)
    }

    /// Live records still sealed under an epoch older than `current_epoch`
    pub fn stale_records(&self, current_epoch: u32) -> VaultResult<Vec<String>> {
        Ok(self
            .table
            .all()?
            .into_iter()
            .filter(|row| !row.tombstoned && row.key_epoch < current_epoch)
            .map(|row| row.record_id)
            .collect())
    }

    pub fn stats(&self, current_epoch: u32) -> VaultResult<StoreStats> {
        let counts = self.table.counts()?;
        let stale = self.stale_records(current_epoch)?.len() as u64;

        Ok(StoreStats {
            records: counts.live,
            tombstoned: counts.tombstoned,
            stale,
            plaintext_bytes: counts.plaintext_bytes,
            stored_bytes: self.fs.dir_size(DATA_DIR)?,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ROTATION SUPPORT
    // ═══════════════════════════════════════════════════════════════════════

    /// Live record ids still sealed under `epoch`
    pub fn ids_at_epoch(&self, epoch: u32) -> VaultResult<Vec<String>> {
        self.table.ids_at_epoch(epoch)
    }

    /// Move one record from `old` to `new`. Safe to repeat after a crash at
    /// any point.
    pub fn reseal_record(&self, old: &MasterKey, new: &MasterKey, record_id: &str) -> VaultResult<()> {
        let row = self
            .table
            .get(record_id)?
            .ok_or_else(|| VaultError::NotFound(record_id.to_string()))?;

        if row.key_epoch == new.epoch() {
            self.fs.shred_file(&payload_path(record_id, old.epoch()))?;
            return Ok(());
        }
        check_epoch(&row, old)?;

        let data = Zeroizing::new(self.open_payload(old, &row)?);
        let metadata_json = Zeroizing::new(self.open_metadata_bytes(old, &row)?);

        let epoch = new.epoch();
        let payload_nonce = self.nonces.next(epoch, &self.table)?;
        let metadata_nonce = self.nonces.next(epoch, &self.table)?;

        let payload = seal(new, &payload_nonce, &data, &record_aad(record_id, Part::Payload, epoch))?;
        let metadata_ciphertext = seal(
            new,
            &metadata_nonce,
            &metadata_json,
            &record_aad(record_id, Part::Metadata, epoch),
        )?;

        let new_path = payload_path(record_id, epoch);
        self.fs.write_file(&new_path, &payload)?;

        let resealed = ResealedRow {
            key_epoch: epoch,
            payload_nonce: payload_nonce.to_vec(),
            metadata_nonce: metadata_nonce.to_vec(),
            metadata_ciphertext,
            updated_at: Utc::now(),
        };

        if !self.table.reseal(record_id, row.key_epoch, &resealed)? {
            self.fs.shred_file(&new_path)?;
            return Err(VaultError::NotFound(record_id.to_string()));
        }

        if let Err(e) = self.fs.shred_file(&payload_path(record_id, row.key_epoch)) {
            log::warn!("Old payload of {} left for the orphan sweep: {}", record_id, e);
        }

        Ok(())
    }

    /// Drop in-memory nonce windows for an epoch no longer in use
    pub fn forget_epoch(&self, epoch: u32) {
        self.nonces.forget(epoch);
    }

    /// Shred payload files that no row points at
    pub fn sweep_orphans(&self) -> VaultResult<usize> {
        let mut swept = self.fs.sweep_temp_files(DATA_DIR)?;

        for name in self.fs.list_dir(DATA_DIR)? {
            let keep = match parse_payload_name(&name) {
                Some((record_id, epoch)) => self
                    .table
                    .get(record_id)?
                    .map_or(false, |row| row.key_epoch == epoch),
                None => true,
            };

            if !keep {
                self.fs.shred_file(&format!("{}/{}", DATA_DIR, name))?;
                swept += 1;
            }
        }

        if swept > 0 {
            log::info!("Swept {} orphaned payload file(s)", swept);
        }
        Ok(swept)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    fn live_row(&self, record_id: &str) -> VaultResult<RecordRow> {
        match self.table.get(record_id)? {
            Some(row) if !row.tombstoned => Ok(row),
            _ => Err(VaultError::NotFound(record_id.to_string())),
        }
    }

    /// Open the payload of a row read earlier. A failure on a row that has
    /// since been deleted is `NotFound`, not an integrity failure.
    fn read_payload(&self, key: &MasterKey, row: &RecordRow) -> VaultResult<Vec<u8>> {
        match self.open_payload(key, row) {
            Err(e) if e.is_integrity_concern() => match self.table.get(&row.record_id)? {
                Some(current) if !current.tombstoned => Err(e),
                _ => Err(VaultError::NotFound(row.record_id.clone())),
            },
            other => other,
        }
    }

    fn open_payload(&self, key: &MasterKey, row: &RecordRow) -> VaultResult<Vec<u8>> {
        let ciphertext = self
            .fs
            .read_file(&payload_path(&row.record_id, row.key_epoch))
            .map_err(|e| match e {
                VaultError::NotFound(_) => {
                    VaultError::Corrupted(format!("payload of record {} is missing", row.record_id))
                }
                other => other,
            })?;

        let data = open(
            key,
            &row.record_id,
            &row.payload_nonce,
            &ciphertext,
            &record_aad(&row.record_id, Part::Payload, row.key_epoch),
        )?;

        if data.len() as u64 != row.plaintext_len {
            return Err(VaultError::AuthenticationFailed(row.record_id.clone()));
        }
        Ok(data)
    }

    fn open_metadata_bytes(&self, key: &MasterKey, row: &RecordRow) -> VaultResult<Vec<u8>> {
        open(
            key,
            &row.record_id,
            &row.metadata_nonce,
            &row.metadata_ciphertext,
            &record_aad(&row.record_id, Part::Metadata, row.key_epoch),
        )
    }

    fn open_metadata(&self, key: &MasterKey, row: &RecordRow) -> VaultResult<ImageMetadata> {
        let json = Zeroizing::new(self.open_metadata_bytes(key, row)?);
        serde_json::from_slice(&json).map_err(|e| {
            VaultError::Corrupted(format!("metadata of record {}: {}", row.record_id, e))
        })
    }

    /// Shred every payload file of a record, whatever its epoch
    fn shred_payloads(&self, record_id: &str) -> VaultResult<()> {
        for name in self.fs.list_dir(DATA_DIR)? {
            if matches!(parse_payload_name(&name), Some((id, _)) if id == record_id) {
                self.fs.shred_file(&format!("{}/{}", DATA_DIR, name))?;
            }
        }
        Ok(())
    }
}

/// Rows must be sealed under the session's epoch
fn check_epoch(row: &RecordRow, key: &MasterKey) -> VaultResult<()> {
    use std::cmp::Ordering;

    match row.key_epoch.cmp(&key.epoch()) {
        Ordering::Equal => Ok(()),
        // Moved by a rotation that has not committed yet
        Ordering::Greater => Err(VaultError::RotationInProgress),
        Ordering::Less => Err(VaultError::AuthenticationFailed(row.record_id.clone())),
    }
}

fn seal(
    key: &MasterKey,
    nonce: &aead::NonceBytes,
    plaintext: &[u8],
    aad: &[u8],
) -> VaultResult<Vec<u8>> {
    aead::seal(key.expose(), nonce, plaintext, aad).map_err(|e| VaultError::Encryption(e.0))
}

fn open(
    key: &MasterKey,
    record_id: &str,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> VaultResult<Vec<u8>> {
    let nonce =
        nonce_from_slice(nonce).ok_or_else(|| VaultError::AuthenticationFailed(record_id.to_string()))?;

    aead::open(key.expose(), &nonce, ciphertext, aad)
        .map_err(|_| VaultError::AuthenticationFailed(record_id.to_string()))
}

/// Associated data: record id, part, key epoch
fn record_aad(record_id: &str, part: Part, epoch: u32) -> Vec<u8> {
    let label = part.label();
    let mut aad = Vec::with_capacity(7 + record_id.len() + 1 + label.len() + 4);
    aad.extend_from_slice(b"record:");
    aad.extend_from_slice(record_id.as_bytes());
    aad.push(b':');
    aad.extend_from_slice(label);
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad
}

fn payload_path(record_id: &str, epoch: u32) -> String {
    format!("{}/{}.{}{}", DATA_DIR, record_id, epoch, PAYLOAD_SUFFIX)
}

/// `<id>.<epoch>.enc` -> `(id, epoch)`
fn parse_payload_name(name: &str) -> Option<(&str, u32)> {
    let stem = name.strip_suffix(PAYLOAD_SUFFIX)?;
    let (record_id, epoch) = stem.rsplit_once('.')?;
    Some((record_id, epoch.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

    fn store() -> (TempDir, EncryptedRecordStore) {
        let dir = tempdir().unwrap();
        let store = EncryptedRecordStore::open(dir.path(), 16).unwrap();
        (dir, store)
    }

    fn key(epoch: u32) -> MasterKey {
        MasterKey::from_bytes([epoch as u8; 32], epoch)
    }

    fn payload_file(dir: &TempDir, id: &str, epoch: u32) -> std::path::PathBuf {
        dir.path().join(payload_path(id, epoch))
    }

    #[test]
    fn test_add_get_roundtrip() {
        let (_dir, store) = store();
        let key = key(1);

        let id = store
            .add(&key, PNG, ImageMetadata::named("cat.png").with_tag("pets"))
            .unwrap();
        let record = store.get(&key, &id).unwrap();

        assert_eq!(record.data, PNG);
        assert_eq!(record.metadata.name.as_deref(), Some("cat.png"));
        assert_eq!(record.metadata.mime_type.as_deref(), Some("image/png"));
        assert_eq!(record.metadata.tags, vec!["pets".to_string()]);
    }

    #[test]
    fn test_identical_plaintexts_differ_on_disk() {
        let (dir, store) = store();
        let key = key(1);

        let a = store.add(&key, b"same bytes", ImageMetadata::default()).unwrap();
        let b = store.add(&key, b"same bytes", ImageMetadata::default()).unwrap();

        let fa = std::fs::read(payload_file(&dir, &a, 1)).unwrap();
        let fb = std::fs::read(payload_file(&dir, &b, 1)).unwrap();
        assert_ne!(fa, fb);

        let ra = store.table.get(&a).unwrap().unwrap();
        let rb = store.table.get(&b).unwrap().unwrap();
        let nonces = [&ra.payload_nonce, &ra.metadata_nonce, &rb.payload_nonce, &rb.metadata_nonce];
        for i in 0..nonces.len() {
            for j in i + 1..nonces.len() {
                assert_ne!(nonces[i], nonces[j]);
            }
        }
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let (dir, store) = store();
        let key = key(1);
        let id = store.add(&key, b"holiday photo", ImageMetadata::default()).unwrap();

        let path = payload_file(&dir, &id, 1);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[3] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.get(&key, &id),
            Err(VaultError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_swapped_payloads_fail_authentication() {
        let (dir, store) = store();
        let key = key(1);
        let a = store.add(&key, b"first", ImageMetadata::default()).unwrap();
        let b = store.add(&key, b"other", ImageMetadata::default()).unwrap();

        let fb = std::fs::read(payload_file(&dir, &b, 1)).unwrap();
        std::fs::write(payload_file(&dir, &a, 1), fb).unwrap();

        assert!(matches!(store.get(&key, &a), Err(VaultError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_wrong_key_and_epoch() {
        let (_dir, store) = store();
        let id = store.add(&key(1), b"data", ImageMetadata::default()).unwrap();

        let impostor = MasterKey::from_bytes([0xEE; 32], 1);
        assert!(matches!(store.get(&impostor, &id), Err(VaultError::AuthenticationFailed(_))));
        assert!(matches!(store.get(&key(2), &id), Err(VaultError::AuthenticationFailed(_))));

        let id2 = store.add(&key(2), b"newer", ImageMetadata::default()).unwrap();
        assert!(matches!(store.get(&key(1), &id2), Err(VaultError::RotationInProgress)));
    }

    #[test]
    fn test_delete_and_not_found() {
        let (dir, store) = store();
        let key = key(1);
        let id = store.add(&key, b"to be removed", ImageMetadata::default()).unwrap();

        store.delete(&id).unwrap();
        assert!(!payload_file(&dir, &id, 1).exists());
        assert!(store.table.get(&id).unwrap().is_none());

        assert!(matches!(store.get(&key, &id), Err(VaultError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(VaultError::NotFound(_))));
        assert!(matches!(store.get(&key, "no-such-id"), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_tombstone_is_not_found_and_purged() {
        let (dir, store) = store();
        let key = key(1);
        let id = store.add(&key, b"leftover", ImageMetadata::default()).unwrap();

        // Simulate a shred that never happened
        store.table.set_tombstone(&id).unwrap();
        assert!(matches!(store.get(&key, &id), Err(VaultError::NotFound(_))));
        assert!(store.list(&key).unwrap().is_empty());

        assert_eq!(store.purge().unwrap(), 1);
        assert!(!payload_file(&dir, &id, 1).exists());
        assert!(store.table.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_update_metadata() {
        let (_dir, store) = store();
        let key = key(1);
        let id = store.add(&key, PNG, ImageMetadata::named("a.png")).unwrap();

        let updated = ImageMetadata::named("b.png").with_attribute("album", "2024");
        store.update_metadata(&key, &id, &updated).unwrap();

        assert_eq!(store.get_metadata(&key, &id).unwrap(), updated);
        assert_eq!(store.get(&key, &id).unwrap().data, PNG);
    }

    #[test]
    fn test_list_reports_integrity_failures() {
        let (_dir, store) = store();
        let key = key(1);
        let good = store.add(&key, b"good", ImageMetadata::named("good")).unwrap();
        let bad = store.add(&key, b"bad", ImageMetadata::named("bad")).unwrap();

        {
            let conn = store.table.conn_for_tests();
            conn.execute(
                "UPDATE records SET metadata_ciphertext = zeroblob(40) WHERE record_id = ?1",
                rusqlite::params![bad],
            )
            .unwrap();
        }

        let list = store.list(&key).unwrap();
        assert_eq!(list.len(), 2);
        let by_id = |id: &str| list.iter().find(|s| s.record_id == id).unwrap().clone();
        assert!(by_id(&good).integrity_ok);
        assert!(!by_id(&bad).integrity_ok);
        assert!(by_id(&bad).metadata.is_none());
    }

    #[test]
    fn test_reseal_is_repeatable() {
        let (dir, store) = store();
        let (old, new) = (key(1), key(2));
        let id = store.add(&old, PNG, ImageMetadata::named("x")).unwrap();

        store.reseal_record(&old, &new, &id).unwrap();
        store.reseal_record(&old, &new, &id).unwrap();

        assert!(!payload_file(&dir, &id, 1).exists());
        assert!(payload_file(&dir, &id, 2).exists());
        assert_eq!(store.get(&new, &id).unwrap().data, PNG);
        assert!(store.ids_at_epoch(1).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_orphans() {
        let (dir, store) = store();
        let key = key(1);
        let id = store.add(&key, b"kept", ImageMetadata::default()).unwrap();

        std::fs::write(payload_file(&dir, "ghost", 1), b"orphan").unwrap();
        std::fs::write(payload_file(&dir, &id, 2), b"stray epoch").unwrap();

        assert_eq!(store.sweep_orphans().unwrap(), 2);
        assert!(payload_file(&dir, &id, 1).exists());
        assert_eq!(store.get(&key, &id).unwrap().data, b"kept");
    }

    #[test]
    fn test_payload_gone_after_concurrent_delete_is_not_found() {
        let (dir, store) = store();
        let key = key(1);
        let id = store.add(&key, b"short-lived", ImageMetadata::default()).unwrap();

        // Row read by a `get`, then the record deleted before its payload is opened
        let row = store.live_row(&id).unwrap();
        store.delete(&id).unwrap();
        assert!(matches!(
            store.read_payload(&key, &row),
            Err(VaultError::NotFound(_))
        ));

        // Same point, but the shred left a zeroed file behind a tombstone
        let id = store.add(&key, b"half-deleted", ImageMetadata::default()).unwrap();
        let row = store.live_row(&id).unwrap();
        assert!(store.table.set_tombstone(&id).unwrap());
        let path = payload_file(&dir, &id, 1);
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        std::fs::write(&path, vec![0u8; len]).unwrap();
        assert!(matches!(
            store.read_payload(&key, &row),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_live_record_with_missing_payload_is_corrupted() {
        let (dir, store) = store();
        let key = key(1);
        let id = store.add(&key, b"lost", ImageMetadata::default()).unwrap();

        std::fs::remove_file(payload_file(&dir, &id, 1)).unwrap();
        assert!(matches!(store.get(&key, &id), Err(VaultError::Corrupted(_))));
    }

    #[test]
    fn test_verify_reports_tampering_stale_and_orphans() {
        let (dir, store) = store();
        let current = key(2);
        let good = store.add(&current, b"fine", ImageMetadata::default()).unwrap();
        let tampered = store.add(&current, b"flipped", ImageMetadata::default()).unwrap();
        let old = store.add(&key(1), b"old key", ImageMetadata::default()).unwrap();
        let deleted = store.add(&current, b"gone", ImageMetadata::default()).unwrap();
        store.delete(&deleted).unwrap();

        let path = payload_file(&dir, &tampered, 2);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0x80;
        std::fs::write(&path, bytes).unwrap();
        std::fs::write(payload_file(&dir, "ghost", 2), b"orphan").unwrap();
        std::fs::write(payload_file(&dir, &good, 1), b"stray epoch").unwrap();

        // Metadata still authenticates, so a listing does not notice
        let listed = store.list(&current).unwrap();
        assert!(listed.iter().any(|s| s.record_id == tampered && s.integrity_ok));

        let report = store.verify(&current).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.failed, vec![tampered]);
        assert_eq!(report.stale, vec![old]);
        assert!(report.pending.is_empty());
        assert!(!report.is_healthy());

        let mut orphans = report.orphans;
        orphans.sort();
        let mut expected = vec![format!("ghost.2{}", PAYLOAD_SUFFIX), format!("{}.1{}", good, PAYLOAD_SUFFIX)];
        expected.sort();
        assert_eq!(orphans, expected);
    }

    #[test]
    fn test_verify_clean_store_is_healthy() {
        let (_dir, store) = store();
        let key = key(1);
        store.add(&key, PNG, ImageMetadata::named("a.png")).unwrap();
        store.add(&key, b"second", ImageMetadata::default()).unwrap();

        let report = store.verify(&key).unwrap();
        assert_eq!(report.checked, 2);
        assert!(report.is_healthy());
    }

    #[test]
    fn test_stats_and_stale() {
        let (_dir, store) = store();
        store.add(&key(1), b"12345", ImageMetadata::default()).unwrap();
        store.add(&key(2), b"678", ImageMetadata::default()).unwrap();

        let stats = store.stats(2).unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.plaintext_bytes, 8);
        assert!(stats.stored_bytes > 8);
        assert_eq!(store.stale_records(2).unwrap().len(), 1);
    }

    #[test]
    fn test_detect_mime() {
        assert_eq!(detect_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0]), "image/jpeg");
        assert_eq!(detect_mime(PNG), "image/png");
        assert_eq!(detect_mime(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(detect_mime(b"\0\0\0\x18ftypheic"), "image/heic");
        assert_eq!(detect_mime(b"tiny"), "application/octet-stream");
    }

    #[test]
    fn test_parse_payload_name() {
        assert_eq!(parse_payload_name("abc-def.3.enc"), Some(("abc-def", 3)));
        assert_eq!(parse_payload_name("abc.enc"), None);
        assert_eq!(parse_payload_name("abc.x.enc"), None);
    }
}
