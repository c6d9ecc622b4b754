//! Exclusive lock over the ESP for the duration of an install.
//!
//! Two concurrent installs would race on staged artifacts and on garbage
//! collection, so the second one fails immediately instead of waiting.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

use crate::error::IoResultExt;

/// Held for as long as the install runs. The OS lock is released on drop.
#[derive(Debug)]
pub struct EspLock {
    file: File,
    path: PathBuf,
}

impl EspLock {
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).at_path(parent)?;
        }

        // Do not unlink the lock file on release. Unlinking a still-locked file
        // lets a second process create a new file at the same path and lock it
        // independently.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .at_path(lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        if file.try_lock_exclusive().is_err() {
            anyhow::bail!(
                "ESP is locked by another install process: {}",
                lock_path.display()
            );
        }
        debug!(path = %lock_path.display(), "acquired ESP lock");

        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EspLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
