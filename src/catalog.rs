//! Compression policy: which artifact kinds are left alone, which suffix each
//! compressor produces, and how an already-compressed file is recognized.
//!
//! A [`CompressionCatalog`] is built once at startup and then only read.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Artifact kinds that are never compressed.
///
/// The OSTree commit and the live media carry their own compression or are
/// consumed as-is by boot tooling.
pub const DEFAULT_SKIP_KINDS: &[&str] = &[
    "ostree",
    "live-iso",
    "live-kernel",
    "live-initramfs",
    "live-rootfs",
];

/// Compression algorithm applied to disk images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Compressor {
    #[default]
    Gzip,
    Xz,
    Zstd,
}

impl Compressor {
    pub const ALL: [Compressor; 3] = [Compressor::Gzip, Compressor::Xz, Compressor::Zstd];

    pub fn name(self) -> &'static str {
        match self {
            Compressor::Gzip => "gzip",
            Compressor::Xz => "xz",
            Compressor::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compressor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" | "gz" => Ok(Compressor::Gzip),
            "xz" => Ok(Compressor::Xz),
            "zstd" | "zst" => Ok(Compressor::Zstd),
            other => bail!(
                "unsupported compressor '{}'; expected one of: gzip, xz, zstd",
                other
            ),
        }
    }
}

/// Speed/size trade-off requested from the compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    #[default]
    Default,
    Fast,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    catalog: CatalogSection,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogSection {
    #[serde(default)]
    skip: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompressionCatalog {
    skip: BTreeSet<String>,
}

impl Default for CompressionCatalog {
    fn default() -> Self {
        Self {
            skip: DEFAULT_SKIP_KINDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl CompressionCatalog {
    /// Default catalog extended with additional skip kinds.
    pub fn with_skip<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut catalog = Self::default();
        catalog.skip.extend(extra.into_iter().map(Into::into));
        catalog
    }

    /// Default catalog extended with the `[catalog] skip` list of a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog config {}", path.display()))?;
        let parsed: CatalogFile = toml::from_str(&text)
            .with_context(|| format!("Failed to parse catalog config {}", path.display()))?;
        for kind in &parsed.catalog.skip {
            if kind.trim().is_empty() {
                bail!("empty artifact kind in '{}'", path.display());
            }
        }
        Ok(Self::with_skip(parsed.catalog.skip))
    }

    pub fn should_skip(&self, kind: &str) -> bool {
        self.skip.contains(kind)
    }

    pub fn skip_kinds(&self) -> impl Iterator<Item = &str> {
        self.skip.iter().map(String::as_str)
    }

    pub fn suffix_for(&self, compressor: Compressor) -> &'static str {
        match compressor {
            Compressor::Gzip => ".gz",
            Compressor::Xz => ".xz",
            Compressor::Zstd => ".zst",
        }
    }

    /// True for a suffix produced by *any* compressor, so a build compressed
    /// earlier with a different choice is never compressed twice.
    pub fn is_already_compressed(&self, path: &str) -> bool {
        self.strip_suffix(path).is_some()
    }

    /// File name the artifact had before compression, if `path` is compressed.
    pub fn strip_suffix<'a>(&self, path: &'a str) -> Option<&'a str> {
        Compressor::ALL
            .iter()
            .find_map(|c| path.strip_suffix(self.suffix_for(*c)))
            .filter(|stem| !stem.is_empty())
    }
}
