use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::CompressError;

pub const LOCK_FILENAME: &str = ".compress.lock";

/// Exclusive advisory lock on a build directory; released on drop.
///
/// The lock file itself is left in the build directory. Unlinking it while
/// held would let a later run lock a fresh inode alongside the current holder.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
}

impl BuildLock {
    pub fn acquire(build_dir: &Path) -> Result<Self> {
        let path = build_dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(CompressError::BuildLocked {
                dir: build_dir.to_path_buf(),
            }
            .into());
        }

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn is_locked(dir: &Path) -> bool {
        matches!(
            BuildLock::acquire(dir).map_err(|e| e.downcast::<CompressError>()),
            Err(Ok(CompressError::BuildLocked { .. }))
        )
    }

    #[test]
    fn second_writer_is_refused() {
        let tmp = TempDir::new().unwrap();
        let held = BuildLock::acquire(tmp.path()).unwrap();
        assert!(is_locked(tmp.path()));

        drop(held);
        BuildLock::acquire(tmp.path()).unwrap();
    }

    #[test]
    fn lock_file_outlives_the_holder() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join(LOCK_FILENAME);

        let first = BuildLock::acquire(tmp.path()).unwrap();
        drop(first);
        assert!(lock_path.exists());

        // A holder that took the surviving file still excludes newcomers.
        let second = BuildLock::acquire(tmp.path()).unwrap();
        assert!(lock_path.exists());
        assert!(is_locked(tmp.path()));
        drop(second);
    }
}
