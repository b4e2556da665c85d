//! Fatal failure taxonomy for a compression run.
//!
//! Library functions return `anyhow::Result`; these variants are the root
//! causes callers (and tests) can downcast to.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("no build metadata found in '{}'", dir.display())]
    MetadataMissing { dir: PathBuf },

    #[error("invalid build metadata in '{}': {reason}", dir.display())]
    InvalidMetadata { dir: PathBuf, reason: String },

    #[error("compressing '{}' failed: {reason}", path.display())]
    CompressionFailed { path: PathBuf, reason: String },

    #[error(
        "verification of '{}' failed: expected {expected}, found {actual}",
        path.display()
    )]
    VerificationMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("compressed name '{path}' for '{kind}' is already used by another artifact")]
    PathCollision { kind: String, path: String },

    #[error("build directory '{}' is locked by another process", dir.display())]
    BuildLocked { dir: PathBuf },
}
