//! Process-wide installer lock.
//!
//! Only one installation may run on a host at a time; concurrent runs would
//! race over the same mount points and cache record. The lock is an advisory
//! `flock` held for the lifetime of the guard, and a second invocation fails
//! fast instead of waiting.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// RAII guard: the lock is released when the guard is dropped.
#[derive(Debug)]
pub struct InstallerLock {
    file: File,
    path: PathBuf,
}

impl InstallerLock {
    /// Take the exclusive lock at `path`, creating the file if needed.
    pub fn acquire(path: &Path) -> Result<Self> {
        debug!("Checking if this is the only installer running");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }

        // The lock file is never unlinked: removing a still-locked file lets a
        // second process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            anyhow::bail!(
                "lock file {} is held; another installer might be running",
                path.display()
            );
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run/installer.lock");

        let first = InstallerLock::acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());

        let second = InstallerLock::acquire(&path);
        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains("another installer"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("installer.lock");

        drop(InstallerLock::acquire(&path).unwrap());
        assert!(InstallerLock::acquire(&path).is_ok());
        assert!(path.exists());
    }
}
