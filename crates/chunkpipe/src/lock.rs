use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, error};

const LOCK_SUFFIX: &str = ".lock";

/// Get the path to the lock marker for a given media file (`<path>.lock`)
pub fn lock_path(file_path: &Path) -> PathBuf {
    let mut name = OsString::from(file_path.as_os_str());
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Inverse of [`lock_path`]: the media file a marker belongs to
pub fn locked_source(marker: &Path) -> Option<PathBuf> {
    let s = marker.to_str()?;
    s.strip_suffix(LOCK_SUFFIX)
        .filter(|rest| !rest.is_empty())
        .map(PathBuf::from)
}

/// Check if a lock marker exists for a file
pub fn is_locked(file_path: &Path) -> bool {
    lock_path(file_path).exists()
}

/// Claim a file by creating its lock marker.
///
/// Returns `false` if the marker already exists (another run owns the file,
/// or a crashed run left it behind).
pub fn acquire(file_path: &Path) -> Result<bool> {
    let marker = lock_path(file_path);
    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to create lock marker: {}", marker.display())),
    }
}

/// Remove the lock marker; a marker that is already gone is fine
pub fn release(file_path: &Path) -> Result<()> {
    let marker = lock_path(file_path);
    match fs::remove_file(&marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove lock marker: {}", marker.display())),
    }
}

/// Scoped claim on a source file; the marker is removed when the guard drops
#[derive(Debug)]
pub struct LockGuard {
    source: PathBuf,
}

impl LockGuard {
    /// Acquire the lock, or `None` if the file is already claimed
    pub fn acquire(file_path: &Path) -> Result<Option<LockGuard>> {
        if acquire(file_path)? {
            debug!("Locked {}", file_path.display());
            Ok(Some(LockGuard {
                source: file_path.to_path_buf(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match release(&self.source) {
            Ok(()) => debug!("Released lock for {}", self.source.display()),
            Err(e) => error!("Could not remove lock file for {}: {:#}", self.source.display(), e),
        }
    }
}
