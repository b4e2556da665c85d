//! Per-build metadata record (`meta.json`).
//!
//! The record is the single source of truth for which image files exist in a
//! build directory and what their checksums are. It is only ever replaced
//! whole: [`persist`] writes a sibling temp file and renames it over
//! `meta.json`, so a reader sees either the old or the new record.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::CompressError;
use crate::files::{sync_dir, tmp_name};

pub const METADATA_FILENAME: &str = "meta.json";

/// One produced image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// File name relative to the build directory.
    pub path: String,
    pub sha256: String,
    pub size: u64,
    /// Digest of the artifact before compression. Written once.
    #[serde(
        rename = "uncompressed-sha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub uncompressed_sha256: Option<String>,
    #[serde(
        rename = "uncompressed-size",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub uncompressed_size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageEntry {
    pub fn new(path: impl Into<String>, sha256: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            sha256: sha256.into(),
            size,
            uncompressed_sha256: None,
            uncompressed_size: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default)]
    pub images: BTreeMap<String, ImageEntry>,
    /// Every other top-level field, written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BuildMetadata {
    /// Kind whose entry currently points at `path`, if any.
    pub fn kind_for_path(&self, path: &str) -> Option<&str> {
        self.images
            .iter()
            .find(|(_, entry)| entry.path == path)
            .map(|(kind, _)| kind.as_str())
    }

    /// Check that every path is a plain file name and no two kinds share one.
    pub fn validate(&self, dir: &Path) -> Result<(), CompressError> {
        let invalid = |reason: String| CompressError::InvalidMetadata {
            dir: dir.to_path_buf(),
            reason,
        };

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for (kind, entry) in &self.images {
            let p = entry.path.as_str();
            if p.is_empty() || p == "." || p == ".." || p.contains('/') || p.contains('\\') {
                return Err(invalid(format!(
                    "image '{kind}' has unsafe path {p:?}; expected a file name"
                )));
            }
            if !seen.insert(p) {
                return Err(invalid(format!(
                    "image '{kind}' shares path '{p}' with another image"
                )));
            }
        }
        Ok(())
    }

    /// Canonical serialized form: sorted keys, pretty-printed, newline-terminated.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        // Round-trip through `Value` so flattened fields get sorted with the rest.
        let value = serde_json::to_value(self).context("Failed to serialize build metadata")?;
        let mut bytes =
            serde_json::to_vec_pretty(&value).context("Failed to serialize build metadata")?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

pub fn metadata_path(build_dir: &Path) -> PathBuf {
    build_dir.join(METADATA_FILENAME)
}

/// Read and validate `meta.json` from a build directory.
pub fn load(build_dir: &Path) -> Result<BuildMetadata> {
    let path = metadata_path(build_dir);
    if !path.is_file() {
        return Err(CompressError::MetadataMissing {
            dir: build_dir.to_path_buf(),
        }
        .into());
    }
    let bytes = fs::read(&path)
        .with_context(|| format!("Failed to read build metadata {}", path.display()))?;
    let meta: BuildMetadata = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse build metadata {}", path.display()))?;
    meta.validate(build_dir)?;
    Ok(meta)
}

/// Atomically replace `meta.json` in a build directory.
pub fn persist(build_dir: &Path, meta: &BuildMetadata) -> Result<()> {
    let bytes = meta.to_canonical_json()?;
    let path = metadata_path(build_dir);
    let tmp = build_dir.join(tmp_name(&format!(".{METADATA_FILENAME}")));

    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .and_then(|mut f| {
            f.write_all(&bytes)?;
            f.sync_all()
        })
        .with_context(|| format!("Failed to write temporary metadata {}", tmp.display()))
        .and_then(|()| {
            fs::rename(&tmp, &path).with_context(|| {
                format!("Failed to rename {} to {}", tmp.display(), path.display())
            })
        });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    sync_dir(build_dir)
}
