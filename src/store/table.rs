//! GraphiVault - Record Table
//!
//! SQLite rows for encrypted records plus durable nonce reservations.
//! Rows carry only ciphertext and non-secret bookkeeping.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::crypto::nonce::{ReservationStore, FIRST_RECORD_COUNTER};
use crate::error::{VaultError, VaultResult};

/// Database file inside the vault root
pub const DB_FILE: &str = "records.db";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        record_id TEXT PRIMARY KEY,
        key_epoch INTEGER NOT NULL,
        payload_nonce BLOB NOT NULL,
        metadata_nonce BLOB NOT NULL,
        metadata_ciphertext BLOB NOT NULL,
        plaintext_len INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        tombstoned INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_records_epoch ON records(key_epoch);

    CREATE TABLE IF NOT EXISTS nonce_reservations (
        key_epoch INTEGER PRIMARY KEY,
        reserved_until INTEGER NOT NULL
    );
"#;

const COLUMNS: &str = "record_id, key_epoch, payload_nonce, metadata_nonce, \
     metadata_ciphertext, plaintext_len, created_at, updated_at, tombstoned";

/// One persisted record row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub record_id: String,
    pub key_epoch: u32,
    pub payload_nonce: Vec<u8>,
    pub metadata_nonce: Vec<u8>,
    pub metadata_ciphertext: Vec<u8>,
    pub plaintext_len: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tombstoned: bool,
}

/// Re-sealed fields written when a record moves to a new epoch
#[derive(Debug, Clone)]
pub struct ResealedRow {
    pub key_epoch: u32,
    pub payload_nonce: Vec<u8>,
    pub metadata_nonce: Vec<u8>,
    pub metadata_ciphertext: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// Row counts for stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub live: u64,
    pub tombstoned: u64,
    pub plaintext_bytes: u64,
}

/// Record Table - SQLite backed
pub struct RecordTable {
    conn: Mutex<Connection>,
}

impl RecordTable {
    /// Open or create the database
    pub fn open(path: &Path) -> VaultResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECORDS
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a new row. This is the point at which a record becomes visible.
    pub fn insert(&self, row: &RecordRow) -> VaultResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (record_id, key_epoch, payload_nonce, metadata_nonce,
                metadata_ciphertext, plaintext_len, created_at, updated_at, tombstoned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.record_id,
                row.key_epoch,
                row.payload_nonce,
                row.metadata_nonce,
                row.metadata_ciphertext,
                row.plaintext_len as i64,
                row.created_at.to_rfc3339(),
                row.updated_at.to_rfc3339(),
                row.tombstoned,
            ],
        )?;
        Ok(())
    }

    /// Fetch a row, tombstoned or not
    pub fn get(&self, record_id: &str) -> VaultResult<Option<RecordRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM records WHERE record_id = ?1", COLUMNS),
                params![record_id],
                map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All rows, oldest first
    pub fn all(&self) -> VaultResult<Vec<RecordRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM records ORDER BY created_at, record_id",
            COLUMNS
        ))?;
        let rows = stmt.query_map([], map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Ids of live rows sealed under `epoch`
    pub fn ids_at_epoch(&self, epoch: u32) -> VaultResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT record_id FROM records
             WHERE key_epoch = ?1 AND tombstoned = 0
             ORDER BY created_at, record_id",
        )?;
        let ids = stmt.query_map(params![epoch], |row| row.get(0))?;
        Ok(ids.collect::<Result<Vec<String>, _>>()?)
    }

    /// Ids of tombstoned rows
    pub fn tombstoned(&self) -> VaultResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT record_id FROM records WHERE tombstoned = 1")?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<Result<Vec<String>, _>>()?)
    }

    /// Mark a live row deleted. False if it was absent or already tombstoned.
    pub fn set_tombstone(&self, record_id: &str) -> VaultResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE records SET tombstoned = 1 WHERE record_id = ?1 AND tombstoned = 0",
            params![record_id],
        )?;
        Ok(changed > 0)
    }

    pub fn remove(&self, record_id: &str) -> VaultResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM records WHERE record_id = ?1", params![record_id])?;
        Ok(changed > 0)
    }

    /// Replace sealed metadata of a live row at `epoch`
    pub fn update_metadata(
        &self,
        record_id: &str,
        epoch: u32,
        nonce: &[u8],
        ciphertext: &[u8],
        updated_at: DateTime<Utc>,
    ) -> VaultResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE records
             SET metadata_nonce = ?1, metadata_ciphertext = ?2, updated_at = ?3
             WHERE record_id = ?4 AND key_epoch = ?5 AND tombstoned = 0",
            params![nonce, ciphertext, updated_at.to_rfc3339(), record_id, epoch],
        )?;
        Ok(changed > 0)
    }

    /// Move a row from `from_epoch` to the re-sealed fields. False if the row
    /// is no longer at `from_epoch`.
    pub fn reseal(&self, record_id: &str, from_epoch: u32, resealed: &ResealedRow) -> VaultResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE records
             SET key_epoch = ?1, payload_nonce = ?2, metadata_nonce = ?3,
                 metadata_ciphertext = ?4, updated_at = ?5
             WHERE record_id = ?6 AND key_epoch = ?7",
            params![
                resealed.key_epoch,
                resealed.payload_nonce,
                resealed.metadata_nonce,
                resealed.metadata_ciphertext,
                resealed.updated_at.to_rfc3339(),
                record_id,
                from_epoch,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn counts(&self) -> VaultResult<TableCounts> {
        let conn = self.conn.lock();
        let (live, tombstoned, bytes): (i64, i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN tombstoned = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN tombstoned = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN tombstoned = 0 THEN plaintext_len ELSE 0 END), 0)
             FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(TableCounts {
            live: live.max(0) as u64,
            tombstoned: tombstoned.max(0) as u64,
            plaintext_bytes: bytes.max(0) as u64,
        })
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

impl ReservationStore for RecordTable {
    fn reserve(&self, epoch: u32, block: u64) -> VaultResult<(u64, u64)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT reserved_until FROM nonce_reservations WHERE key_epoch = ?1",
                params![epoch],
                |row| row.get(0),
            )
            .optional()?;

        let start = match current {
            Some(bound) if bound >= FIRST_RECORD_COUNTER as i64 => bound as u64,
            Some(bound) => {
                return Err(VaultError::Corrupted(format!(
                    "nonce reservation {} for epoch {} is invalid",
                    bound, epoch
                )));
            }
            None => FIRST_RECORD_COUNTER,
        };

        let end = start
            .checked_add(block)
            .filter(|end| *end <= i64::MAX as u64)
            .ok_or(VaultError::NonceExhausted(epoch))?;

        tx.execute(
            "INSERT INTO nonce_reservations (key_epoch, reserved_until) VALUES (?1, ?2)
             ON CONFLICT(key_epoch) DO UPDATE SET reserved_until = excluded.reserved_until",
            params![epoch, end as i64],
        )?;
        tx.commit()?;

        Ok((start, end))
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    let plaintext_len: i64 = row.get(5)?;
    Ok(RecordRow {
        record_id: row.get(0)?,
        key_epoch: row.get(1)?,
        payload_nonce: row.get(2)?,
        metadata_nonce: row.get(3)?,
        metadata_ciphertext: row.get(4)?,
        plaintext_len: plaintext_len.max(0) as u64,
        created_at: parse_time(6, row.get(6)?)?,
        updated_at: parse_time(7, row.get(7)?)?,
        tombstoned: row.get(8)?,
    })
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
