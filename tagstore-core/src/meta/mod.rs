//! Crash-consistent metadata files
//!
//! A metadata file at `path` is never observed torn. While a write is in
//! flight a `<path>.lock` marker exists and `<path>.back` holds the last
//! known-good contents:
//!
//! - Read: if the lock exists read `.back`, otherwise read `path`.
//! - Write (no lock): copy `path` to `.back`, create the lock, write `path`,
//!   remove the lock, remove `.back`.
//! - Write (lock left by a crash): `.back` is already good, so only rewrite
//!   `path`, then remove the lock and `.back`.
//!
//! Every failure on the write side is [`TagStoreError::Fatal`]: the caller
//! must stop using the object that owns the file.

pub mod frame;

use crate::config::{BACKUP_SUFFIX, LOCK_SUFFIX};
use crate::{Result, TagStoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// When writes are forced to stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync metadata, markers and column data before returning (safest, slowest)
    Immediate,
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

impl SyncPolicy {
    pub fn is_immediate(&self) -> bool {
        matches!(self, SyncPolicy::Immediate)
    }
}

/// `<path>.lock`
pub fn lock_path(path: &Path) -> PathBuf {
    sidecar(path, LOCK_SUFFIX)
}

/// `<path>.back`
pub fn backup_path(path: &Path) -> PathBuf {
    sidecar(path, BACKUP_SUFFIX)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Read the last committed value, `None` if it was never written
pub fn read_safe<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if lock_path(path).exists() {
        warn!("Metadata {:?} is locked by an interrupted write, reading backup", path);
        return read_framed(&backup_path(path));
    }
    read_framed(path)
}

fn read_framed<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => frame::decode(&data).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TagStoreError::Io(e)),
    }
}

/// Replace the value at `path` so that readers see either the old or the new value
pub fn write_safe<T: Serialize>(path: &Path, value: &T, sync: SyncPolicy) -> Result<()> {
    let blob = frame::encode(value)?;
    let lock = lock_path(path);
    let back = backup_path(path);

    let staged = (|| -> io::Result<()> {
        if lock.exists() {
            warn!("Metadata {:?} has a stale lock, rewriting over the backup", path);
        } else {
            if path.exists() {
                fs::copy(path, &back)?;
                if sync.is_immediate() {
                    File::open(&back)?.sync_all()?;
                }
            }
            write_file(&lock, b"lock", sync)?;
        }
        write_file(path, &blob, sync)
    })();
    if let Err(e) = staged {
        error!("Failed to write metadata {:?}: {}", path, e);
        return Err(TagStoreError::Fatal(format!(
            "Write routine for {:?} failed, cannot recover: {}",
            path, e
        )));
    }

    // Both removals must succeed, otherwise the durable state is ambiguous.
    if let Err(e) = fs::remove_file(&lock) {
        error!("Failed to remove metadata lock {:?}: {}", lock, e);
        return Err(TagStoreError::Fatal(format!(
            "Could not remove {:?}: {}",
            lock, e
        )));
    }
    match fs::remove_file(&back) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            error!("Failed to remove metadata backup {:?}: {}", back, e);
            return Err(TagStoreError::Fatal(format!(
                "Could not remove {:?}: {}",
                back, e
            )));
        }
    }
    if sync.is_immediate() {
        if let Some(dir) = path.parent() {
            sync_dir(dir).map_err(|e| {
                TagStoreError::Fatal(format!("Could not sync directory {:?}: {}", dir, e))
            })?;
        }
    }
    Ok(())
}

/// Create or overwrite a small file in one go
pub fn write_file(path: &Path, data: &[u8], sync: SyncPolicy) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    if sync.is_immediate() {
        file.sync_all()?;
    }
    Ok(())
}

#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_data()
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
