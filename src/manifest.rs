//! GraphiVault - Vault Manifest
//!
//! The non-secret identity of a vault: salt, KDF parameters, key epoch and a
//! sealed known-plaintext verifier. Stored as JSON next to the record store.
//!
//! Validation order on load is fixed: checksum, schema version, KDF
//! parameters. The verifier is only opened at unlock, so a damaged manifest
//! never costs a KDF run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crypto::aead::{self, nonce_from_slice, NONCE_LEN};
use crate::crypto::kdf::{generate_salt, KdfParams, KeyDeriver, MIN_SALT_LEN};
use crate::crypto::keys::{MasterKey, RootKey, SecretPassword};
use crate::crypto::nonce::verifier_nonce;
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::SecureFs;

/// Manifest file name inside the vault root
pub const MANIFEST_FILE: &str = "vault.manifest";

/// Current on-disk schema
pub const SCHEMA_VERSION: u32 = 1;

/// Known plaintext sealed at creation
pub const VERIFIER_PLAINTEXT: &[u8] = b"GRAPHIVAULT:VERIFIER:v1";

/// Epoch of a freshly initialized vault
pub const INITIAL_EPOCH: u32 = 1;

/// Persisted vault identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultManifest {
    pub vault_id: String,
    pub schema_version: u32,
    pub key_epoch: u32,
    pub kdf: KdfParams,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub verifier_nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub verifier_ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub rotated_at: Option<DateTime<Utc>>,
    pub checksum: String,
}

impl VaultManifest {
    // ═══════════════════════════════════════════════════════════════════════
    // CREATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Create and persist a new manifest. Fails if one already exists.
    pub fn create(
        fs: &SecureFs,
        password: &SecretPassword,
        params: &KdfParams,
        deriver: &dyn KeyDeriver,
    ) -> VaultResult<Self> {
        if fs.exists(MANIFEST_FILE) {
            return Err(VaultError::AlreadyInitialized(fs.root().display().to_string()));
        }

        let vault_id = Uuid::new_v4().to_string();
        let (manifest, _key) = Self::seal_new(
            vault_id,
            INITIAL_EPOCH,
            Utc::now(),
            password,
            params,
            deriver,
        )?;
        manifest.save(fs)?;

        log::info!("Vault {} initialized ({:?})", manifest.vault_id, params.algorithm);
        Ok(manifest)
    }

    /// Build a checksummed manifest for `epoch` and return the matching record key
    pub(crate) fn seal_new(
        vault_id: String,
        epoch: u32,
        created_at: DateTime<Utc>,
        password: &SecretPassword,
        params: &KdfParams,
        deriver: &dyn KeyDeriver,
    ) -> VaultResult<(Self, MasterKey)> {
        params.validate()?;

        let salt = generate_salt().to_vec();
        let root = deriver.derive(password, &salt, params)?;

        let nonce = verifier_nonce(epoch);
        let verifier_key = root.verifier_key()?;
        let verifier_ciphertext = aead::seal(
            verifier_key.expose(),
            &nonce,
            VERIFIER_PLAINTEXT,
            &verifier_aad(&vault_id, epoch),
        )
        .map_err(|e| VaultError::Encryption(e.0))?;

        let mut manifest = Self {
            vault_id,
            schema_version: SCHEMA_VERSION,
            key_epoch: epoch,
            kdf: params.clone(),
            salt,
            verifier_nonce: nonce.to_vec(),
            verifier_ciphertext,
            created_at,
            rotated_at: None,
            checksum: String::new(),
        };
        manifest.checksum = manifest.compute_checksum();

        Ok((manifest, root.into_master_key(epoch)?))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PERSISTENCE
    // ═══════════════════════════════════════════════════════════════════════

    /// Load and validate. `NotFound` if absent, `Corrupted` if damaged.
    pub fn load(fs: &SecureFs) -> VaultResult<Self> {
        let data = fs.read_file(MANIFEST_FILE).map_err(|e| match e {
            VaultError::NotFound(_) => {
                VaultError::NotFound(format!("no manifest in {}", fs.root().display()))
            }
            other => other,
        })?;

        let manifest: Self = serde_json::from_slice(&data)
            .map_err(|e| VaultError::Corrupted(format!("manifest unreadable: {}", e)))?;

        manifest.validate()?;
        Ok(manifest)
    }

    /// Persist atomically
    pub fn save(&self, fs: &SecureFs) -> VaultResult<()> {
        let data = serde_json::to_vec_pretty(self)?;
        fs.write_file(MANIFEST_FILE, &data)
    }

    pub fn exists(fs: &SecureFs) -> bool {
        fs.exists(MANIFEST_FILE)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTEGRITY
    // ═══════════════════════════════════════════════════════════════════════

    /// Checksum, then schema version, then KDF parameters
    pub fn validate(&self) -> VaultResult<()> {
        if self.checksum != self.compute_checksum() {
            return Err(VaultError::Corrupted("manifest checksum mismatch".into()));
        }

        if self.schema_version != SCHEMA_VERSION {
            return Err(VaultError::Corrupted(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }

        self.kdf.validate()?;

        if self.salt.len() < MIN_SALT_LEN {
            return Err(VaultError::InvalidParameters(format!(
                "salt of {} bytes is shorter than {}",
                self.salt.len(),
                MIN_SALT_LEN
            )));
        }

        if self.verifier_nonce.len() != NONCE_LEN {
            return Err(VaultError::Corrupted("verifier nonce has wrong length".into()));
        }

        Ok(())
    }

    /// SHA-256 over a length-prefixed encoding of every other field
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"GRAPHIVAULT:MANIFEST:v1");
        put_bytes(&mut hasher, self.vault_id.as_bytes());
        hasher.update(self.schema_version.to_be_bytes());
        hasher.update(self.key_epoch.to_be_bytes());
        hasher.update([self.kdf.algorithm.tag()]);
        hasher.update(self.kdf.iterations.to_be_bytes());
        hasher.update(self.kdf.memory_kib.to_be_bytes());
        hasher.update(self.kdf.parallelism.to_be_bytes());
        put_bytes(&mut hasher, &self.salt);
        put_bytes(&mut hasher, &self.verifier_nonce);
        put_bytes(&mut hasher, &self.verifier_ciphertext);
        put_time(&mut hasher, Some(self.created_at));
        put_time(&mut hasher, self.rotated_at);
        hex::encode(hasher.finalize())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // VERIFICATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Derive the key and open the verifier. Any failure is `WrongPasswordOrCorrupt`.
    pub fn unlock_with(
        &self,
        password: &SecretPassword,
        deriver: &dyn KeyDeriver,
    ) -> VaultResult<MasterKey> {
        let root = deriver
            .derive(password, &self.salt, &self.kdf)
            .map_err(|e| {
                log::error!("Key derivation failed during unlock: {}", e);
                VaultError::WrongPasswordOrCorrupt
            })?;

        if !self.opens_verifier(&root) {
            return Err(VaultError::WrongPasswordOrCorrupt);
        }

        root.into_master_key(self.key_epoch)
    }

    /// True when `password` opens the verifier
    pub fn verify(&self, password: &SecretPassword, deriver: &dyn KeyDeriver) -> bool {
        self.unlock_with(password, deriver).is_ok()
    }

    fn opens_verifier(&self, root: &RootKey) -> bool {
        let Some(nonce) = nonce_from_slice(&self.verifier_nonce) else {
            return false;
        };
        let Ok(verifier_key) = root.verifier_key() else {
            return false;
        };

        match aead::open(
            verifier_key.expose(),
            &nonce,
            &self.verifier_ciphertext,
            &verifier_aad(&self.vault_id, self.key_epoch),
        ) {
            Ok(plaintext) => plaintext == VERIFIER_PLAINTEXT,
            Err(_) => false,
        }
    }
}

/// Associated data binding the verifier to its vault and epoch
fn verifier_aad(vault_id: &str, epoch: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(vault_id.len() + 4 + 9);
    aad.extend_from_slice(b"verifier:");
    aad.extend_from_slice(vault_id.as_bytes());
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad
}

fn put_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn put_time(hasher: &mut Sha256, time: Option<DateTime<Utc>>) {
    match time {
        Some(t) => {
            hasher.update([1u8]);
            hasher.update(t.timestamp().to_be_bytes());
            hasher.update(t.timestamp_subsec_nanos().to_be_bytes());
        }
        None => hasher.update([0u8]),
    }
}

/// Hex encoding for binary manifest fields
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::StandardKdf;
    use tempfile::tempdir;

    fn params() -> KdfParams {
        KdfParams::pbkdf2_sha512(1_000)
    }

    fn create(fs: &SecureFs) -> VaultManifest {
        VaultManifest::create(fs, &"correct-horse".into(), &params(), &StandardKdf).unwrap()
    }

    #[test]
    fn test_create_load_verify() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let created = create(&fs);

        let loaded = VaultManifest::load(&fs).unwrap();
        assert_eq!(created, loaded);
        assert_eq!(loaded.key_epoch, INITIAL_EPOCH);
        assert!(loaded.verify(&"correct-horse".into(), &StandardKdf));
        assert!(!loaded.verify(&"wrong-pw".into(), &StandardKdf));
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        create(&fs);

        let again = VaultManifest::create(&fs, &"other".into(), &params(), &StandardKdf);
        assert!(matches!(again, Err(VaultError::AlreadyInitialized(_))));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        assert!(matches!(VaultManifest::load(&fs), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_tampered_field_detected_before_kdf() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let mut manifest = create(&fs);

        manifest.salt[0] ^= 0xFF;
        manifest.save(&fs).unwrap();

        assert!(matches!(VaultManifest::load(&fs), Err(VaultError::Corrupted(_))));
    }

    #[test]
    fn test_garbage_file_is_corrupted() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        fs.write_file(MANIFEST_FILE, b"{not json").unwrap();
        assert!(matches!(VaultManifest::load(&fs), Err(VaultError::Corrupted(_))));
    }

    #[test]
    fn test_schema_checked_after_checksum() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let mut manifest = create(&fs);

        manifest.schema_version = 99;
        manifest.checksum = manifest.compute_checksum();
        manifest.save(&fs).unwrap();

        match VaultManifest::load(&fs) {
            Err(VaultError::Corrupted(msg)) => assert!(msg.contains("schema")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_kdf_params_rejected_on_load() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let mut manifest = create(&fs);

        manifest.kdf.iterations = 1;
        manifest.checksum = manifest.compute_checksum();
        manifest.save(&fs).unwrap();

        assert!(matches!(
            VaultManifest::load(&fs),
            Err(VaultError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_damaged_verifier_is_ambiguous() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let mut manifest = create(&fs);

        manifest.verifier_ciphertext[0] ^= 0x01;
        manifest.checksum = manifest.compute_checksum();

        assert!(matches!(
            manifest.unlock_with(&"correct-horse".into(), &StandardKdf),
            Err(VaultError::WrongPasswordOrCorrupt)
        ));
    }
}
