//! GraphiVault - Audit Trail
//!
//! Append-only JSON lines, one security event per line. Every entry carries
//! the hash of its predecessor, so editing, removing or reordering lines
//! breaks the chain at that point.
//!
//! Entries never contain secrets. Record ids are stored as truncated
//! SHA-256 digests.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};

/// Audit log file inside the vault root
pub const AUDIT_FILE: &str = "audit.log";

/// `prev_hash` of the first entry
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Hex digits kept from a hashed identifier
const ID_HASH_LEN: usize = 16;

/// Key/value detail of an entry
pub type AuditDetail = BTreeMap<String, String>;

/// Security events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    VaultInitialized,
    UnlockSucceeded,
    UnlockFailed,
    UnlockRejected,
    LockoutStarted,
    Locked,
    IdleTimeout,
    RecordAdded,
    RecordDeleted,
    MetadataUpdated,
    IntegrityFailure,
    RecordsPurged,
    RekeyStarted,
    RekeyCompleted,
    RekeyInterrupted,
}

/// One line of the trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    #[serde(default)]
    pub detail: AuditDetail,
    pub prev_hash: String,
    pub hash: String,
}

/// Fields covered by the entry hash
#[derive(Serialize)]
struct Canonical<'a> {
    seq: u64,
    timestamp: &'a DateTime<Utc>,
    event: AuditEvent,
    detail: &'a AuditDetail,
}

impl AuditEntry {
    /// `SHA-256(prev_hash || canonical JSON)`
    pub fn compute_hash(&self) -> VaultResult<String> {
        let canonical = serde_json::to_vec(&Canonical {
            seq: self.seq,
            timestamp: &self.timestamp,
            event: self.event,
            detail: &self.detail,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Result of walking the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Lines read
    pub entries: u64,
    /// 1-based line number of the first entry that does not verify
    pub first_broken: Option<u64>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }
}

#[derive(Debug, Clone)]
struct ChainHead {
    seq: u64,
    hash: String,
}

/// Hash-chained audit trail
pub struct AuditTrail {
    path: PathBuf,
    head: Mutex<ChainHead>,
}

impl AuditTrail {
    /// Open the trail under `root`, continuing from its last readable entry
    pub fn open(root: &Path) -> VaultResult<Self> {
        let path = root.join(AUDIT_FILE);
        let mut head = ChainHead {
            seq: 0,
            hash: GENESIS_HASH.to_string(),
        };

        for line in read_lines(&path)? {
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => {
                    head = ChainHead {
                        seq: entry.seq,
                        hash: entry.hash,
                    };
                }
                Err(e) => log::warn!("Unreadable audit line skipped: {}", e),
            }
        }

        Ok(Self {
            path,
            head: Mutex::new(head),
        })
    }

    /// Append an event
    pub fn record(
        &self,
        event: AuditEvent,
        detail: AuditDetail,
        timestamp: DateTime<Utc>,
    ) -> VaultResult<AuditEntry> {
        let mut head = self.head.lock();

        let mut entry = AuditEntry {
            seq: head.seq + 1,
            timestamp,
            event,
            detail,
            prev_hash: head.hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()?;

        head.seq = entry.seq;
        head.hash = entry.hash.clone();

        log::debug!("Audit #{} {:?}", entry.seq, entry.event);
        Ok(entry)
    }

    /// Every readable entry, oldest first
    pub fn entries(&self) -> VaultResult<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for (number, line) in read_lines(&self.path)?.into_iter().enumerate() {
            let entry = serde_json::from_str(&line).map_err(|e| {
                VaultError::Corrupted(format!("audit line {}: {}", number + 1, e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// The newest `limit` entries, oldest first
    pub fn recent(&self, limit: usize) -> VaultResult<Vec<AuditEntry>> {
        let mut entries = self.entries()?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    /// Walk the chain from genesis
    pub fn verify_chain(&self) -> VaultResult<ChainVerification> {
        let lines = read_lines(&self.path)?;
        let mut prev_hash = GENESIS_HASH.to_string();
        let mut expected_seq = 1;

        for (index, line) in lines.iter().enumerate() {
            let intact = match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => {
                    let ok = entry.seq == expected_seq
                        && entry.prev_hash == prev_hash
                        && entry.compute_hash()? == entry.hash;
                    prev_hash = entry.hash;
                    expected_seq += 1;
                    ok
                }
                Err(_) => false,
            };

            if !intact {
                log::warn!("Audit chain broken at line {}", index + 1);
                return Ok(ChainVerification {
                    entries: lines.len() as u64,
                    first_broken: Some(index as u64 + 1),
                });
            }
        }

        Ok(ChainVerification {
            entries: lines.len() as u64,
            first_broken: None,
        })
    }
}

/// Truncated SHA-256 of an identifier
pub fn hash_identifier(id: &str) -> String {
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    digest[..ID_HASH_LEN].to_string()
}

/// Build an entry detail map
pub fn detail<const N: usize>(pairs: [(&str, String); N]) -> AuditDetail {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn read_lines(path: &Path) -> VaultResult<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}
