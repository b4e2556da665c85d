//! Resolve a build id to its per-architecture directories.
//!
//! The builds root holds a `builds.json` index, newest build first:
//!
//! ```text
//! builds/
//!   builds.json            {"builds": [{"id": "...", "arches": ["x86_64"]}]}
//!   <id>/<arch>/meta.json
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const BUILDS_INDEX_FILENAME: &str = "builds.json";

pub trait BuildLocator {
    /// Directories of the given build, or of the latest build for `None`.
    fn build_dirs(&self, build_id: Option<&str>) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildRecord {
    pub id: String,
    #[serde(default)]
    pub arches: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BuildsIndex {
    #[serde(default)]
    builds: Vec<BuildRecord>,
}

#[derive(Debug, Clone)]
pub struct BuildsDir {
    root: PathBuf,
}

impl BuildsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(BUILDS_INDEX_FILENAME)
    }

    pub fn load_builds(&self) -> Result<Vec<BuildRecord>> {
        let path = self.index_path();
        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read builds index {}", path.display()))?;
        let parsed: BuildsIndex = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse builds index {}", path.display()))?;
        Ok(parsed.builds)
    }

    pub fn latest_build_id(&self) -> Result<Option<String>> {
        Ok(self.load_builds()?.first().map(|b| b.id.clone()))
    }
}

impl BuildLocator for BuildsDir {
    fn build_dirs(&self, build_id: Option<&str>) -> Result<Vec<PathBuf>> {
        let builds = self.load_builds()?;
        let record = match build_id {
            None => builds.first().ok_or_else(|| {
                anyhow::anyhow!("no builds recorded in '{}'", self.index_path().display())
            })?,
            Some(id) => match builds.iter().find(|b| b.id == id) {
                Some(b) => b,
                None => bail!(
                    "build '{}' not found in '{}'",
                    id,
                    self.index_path().display()
                ),
            },
        };
        if record.arches.is_empty() {
            bail!("build '{}' has no architectures", record.id);
        }
        let build_root = self.root.join(&record.id);
        Ok(record
            .arches
            .iter()
            .map(|arch| build_root.join(arch))
            .collect())
    }
}
