//! Small filesystem helpers shared by the metadata store and the run.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Streaming sha256 of a file, returned with its byte size.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Unique-enough name for a temporary sibling file.
pub(crate) fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub(crate) fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Flush a directory entry change (rename, unlink) to disk.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("Failed to sync directory {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Whether a directory entry is a temp sibling written by [`tmp_name`] for
/// `meta.json` or [`move_into_place`].
fn is_stale_temp(name: &str) -> bool {
    name.starts_with(".meta.json-") || (name.starts_with('.') && name.contains(".partial-"))
}

/// Remove temp siblings abandoned in `dir` by a killed run.
///
/// Only safe while the directory lock is held. Returns how many were removed.
pub(crate) fn sweep_stale_temp(dir: &Path) -> Result<usize> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;
    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_stale_temp(name) || !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        match remove_if_present(&entry.path()) {
            Ok(true) => {
                tracing::info!(path = %entry.path().display(), "removed stale temporary file");
                removed += 1;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "could not remove stale temporary file");
            }
        }
    }
    Ok(removed)
}

/// Move `src` to `dst` so that `dst` is never observed half-written.
///
/// A plain rename is used when both paths share a filesystem. Otherwise the
/// bytes are copied to a hidden sibling of `dst`, synced, and renamed over it.
pub fn move_into_place(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    let file_name = dst
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    let staged = parent.join(tmp_name(&format!(".{file_name}.partial")));
    fs::copy(src, &staged)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), staged.display()))?;
    let result = OpenOptions::new()
        .write(true)
        .open(&staged)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Failed to sync {}", staged.display()))
        .and_then(|()| {
            fs::rename(&staged, dst).with_context(|| {
                format!("Failed to rename {} to {}", staged.display(), dst.display())
            })
        });
    if let Err(e) = result {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    fs::remove_file(src).with_context(|| format!("Failed to remove tmp {}", src.display()))?;
    Ok(())
}
