//! GraphiVault - Secure Filesystem Operations
//!
//! Atomic writes (temp file, fsync, rename) and overwrite-then-remove deletes.
//!
//! Shredding is best effort: copy-on-write filesystems, SSD wear levelling and
//! snapshots may keep old blocks around no matter what is written here.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};

/// Overwrite chunk size
const SHRED_CHUNK: usize = 1024 * 1024;

/// Suffix of in-flight temp files
const TEMP_SUFFIX: &str = ".tmp";

/// Secure Filesystem Handler
#[derive(Debug, Clone)]
pub struct SecureFs {
    /// Root directory
    root: PathBuf,
}

impl SecureFs {
    /// Create new SecureFs with root directory
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get full path for a relative file
    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write file atomically: readers see the old content or the new, never a mix
    pub fn write_file(&self, relative_path: &str, data: &[u8]) -> VaultResult<()> {
        let path = self.full_path(relative_path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_path_for(&path);

        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;

            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)?;
            sync_parent(&path);
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        Ok(())
    }

    /// Read file, mapping absence to `NotFound`
    pub fn read_file(&self, relative_path: &str) -> VaultResult<Vec<u8>> {
        let path = self.full_path(relative_path);

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VaultError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        Ok(data)
    }

    /// Overwrite with zeros, sync, then unlink. Missing files are not an error.
    pub fn shred_file(&self, relative_path: &str) -> VaultResult<()> {
        let path = self.full_path(relative_path);

        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if size > 0 {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let zeros = vec![0u8; SHRED_CHUNK.min(size as usize)];
            let mut remaining = size;
            while remaining > 0 {
                let to_write = remaining.min(zeros.len() as u64) as usize;
                file.write_all(&zeros[..to_write])?;
                remaining -= to_write as u64;
            }
            file.sync_all()?;
        }

        fs::remove_file(&path)?;
        sync_parent(&path);

        Ok(())
    }

    /// Check if file exists
    pub fn exists(&self, relative_path: &str) -> bool {
        self.full_path(relative_path).exists()
    }

    /// List file names in a directory, skipping in-flight temp files
    pub fn list_dir(&self, relative_path: &str) -> VaultResult<Vec<String>> {
        let path = self.full_path(relative_path);
        let mut files = Vec::new();

        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(TEMP_SUFFIX) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Total size of regular files directly under a directory
    pub fn dir_size(&self, relative_path: &str) -> VaultResult<u64> {
        let mut size = 0;
        for name in self.list_dir(relative_path)? {
            let path = self.full_path(relative_path).join(name);
            size += fs::metadata(&path)?.len();
        }
        Ok(size)
    }

    /// Shred temp files left behind by an interrupted write
    pub fn sweep_temp_files(&self, relative_path: &str) -> VaultResult<usize> {
        let dir = self.full_path(relative_path);
        let mut swept = 0;

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TEMP_SUFFIX) {
                let relative = Path::new(relative_path).join(&name);
                self.shred_file(&relative.to_string_lossy())?;
                swept += 1;
            }
        }

        Ok(swept)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Persist the rename itself
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// Directories cannot be opened for sync here
#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
