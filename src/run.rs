//! Compress every eligible image of a build, one artifact at a time.
//!
//! Each artifact moves through an explicit [`ArtifactState`] sequence:
//!
//! ```text
//! Pending ─┬─> SkippedByPolicy
//!          ├─> AlreadyCompressed
//!          └─> Compressing -> Verified -> Swapped -> MetadataPersisted -> OriginalRemoved
//! ```
//!
//! The ordering of the last three steps is what makes a killed run safe to
//! repeat. The compressed file is in place before `meta.json` names it, and the
//! original is only deleted once `meta.json` no longer does. On restart an
//! entry whose path already carries a compressed suffix is done; a leftover
//! original beside it is deleted.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::catalog::{CompressionCatalog, CompressionLevel, Compressor};
use crate::compressor::{ArtifactCompressor, CompressRequest, CompressionBackend};
use crate::error::CompressError;
use crate::files::{move_into_place, remove_if_present, sweep_stale_temp, sync_dir};
use crate::lock::BuildLock;
use crate::metadata::{self, BuildMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Pending,
    SkippedByPolicy,
    AlreadyCompressed,
    Compressing,
    Verified,
    Swapped,
    MetadataPersisted,
    OriginalRemoved,
}

impl ArtifactState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ArtifactState::SkippedByPolicy
                | ArtifactState::AlreadyCompressed
                | ArtifactState::OriginalRemoved
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub compressor: Compressor,
    pub level: CompressionLevel,
    /// Thread hint passed through to the compressor.
    pub threads: u32,
    /// Only these kinds are considered when set. The skip set still wins.
    pub allow_list: Option<BTreeSet<String>>,
}

/// What happened in one build directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirOutcome {
    pub build_dir: PathBuf,
    /// At least one artifact was compressed or a stray original removed.
    pub changed: bool,
    pub states: BTreeMap<String, ArtifactState>,
}

impl DirOutcome {
    pub fn compressed(&self) -> impl Iterator<Item = &str> {
        self.states
            .iter()
            .filter(|(_, s)| **s == ArtifactState::OriginalRemoved)
            .map(|(k, _)| k.as_str())
    }
}

pub struct CompressionRun<'a, B: CompressionBackend> {
    catalog: &'a CompressionCatalog,
    compressor: ArtifactCompressor<B>,
    options: RunOptions,
}

impl<'a, B: CompressionBackend> CompressionRun<'a, B> {
    pub fn new(
        catalog: &'a CompressionCatalog,
        compressor: ArtifactCompressor<B>,
        options: RunOptions,
    ) -> Self {
        Self {
            catalog,
            compressor,
            options,
        }
    }

    /// Process build directories in order, stopping at the first failure.
    pub fn run(&self, build_dirs: &[PathBuf]) -> Result<Vec<DirOutcome>> {
        let mut outcomes = Vec::with_capacity(build_dirs.len());
        for dir in build_dirs {
            outcomes.push(self.run_dir(dir)?);
        }
        Ok(outcomes)
    }

    pub fn run_dir(&self, build_dir: &Path) -> Result<DirOutcome> {
        if !metadata::metadata_path(build_dir).is_file() {
            return Err(CompressError::MetadataMissing {
                dir: build_dir.to_path_buf(),
            }
            .into());
        }
        let _lock = BuildLock::acquire(build_dir)?;
        sweep_stale_temp(build_dir)?;
        let mut meta = metadata::load(build_dir)?;
        let label = dir_label(build_dir);

        if let Some(allow) = &self.options.allow_list {
            for kind in allow.iter().filter(|k| !meta.images.contains_key(*k)) {
                tracing::warn!(kind = %kind, dir = %build_dir.display(), "requested artifact not in build metadata");
            }
        }

        let mut ledger = Ledger {
            states: meta
                .images
                .keys()
                .map(|k| (k.clone(), ArtifactState::Pending))
                .collect(),
        };
        let mut changed = false;
        let kinds: Vec<String> = meta.images.keys().cloned().collect();
        for kind in &kinds {
            changed |= self
                .process_artifact(build_dir, &label, &mut meta, kind, &mut ledger)
                .with_context(|| {
                    format!("Failed to process '{kind}' in {}", build_dir.display())
                })?;
        }

        Ok(DirOutcome {
            build_dir: build_dir.to_path_buf(),
            changed,
            states: ledger.states,
        })
    }

    fn excluded(&self, kind: &str) -> bool {
        self.catalog.should_skip(kind)
            || self
                .options
                .allow_list
                .as_ref()
                .is_some_and(|allow| !allow.contains(kind))
    }

    fn process_artifact(
        &self,
        build_dir: &Path,
        label: &str,
        meta: &mut BuildMetadata,
        kind: &str,
        ledger: &mut Ledger,
    ) -> Result<bool> {
        let Some(entry) = meta.images.get(kind).cloned() else {
            return Ok(false);
        };

        if self.excluded(kind) {
            ledger.advance(kind, ArtifactState::SkippedByPolicy);
            println!("[compress:{label}] skipping {kind} ({})", entry.path);
            return Ok(self.remove_stray_original(build_dir, label, meta, &entry.path));
        }
        if self.catalog.is_already_compressed(&entry.path) {
            ledger.advance(kind, ArtifactState::AlreadyCompressed);
            println!("[compress:{label}] {} already compressed", entry.path);
            return Ok(self.remove_stray_original(build_dir, label, meta, &entry.path));
        }

        let new_path = format!(
            "{}{}",
            entry.path,
            self.catalog.suffix_for(self.options.compressor)
        );
        if meta.kind_for_path(&new_path).is_some_and(|other| other != kind) {
            return Err(CompressError::PathCollision {
                kind: kind.to_string(),
                path: new_path,
            }
            .into());
        }

        ledger.advance(kind, ArtifactState::Compressing);
        println!(
            "[compress:{label}] compressing {} with {}",
            entry.path, self.options.compressor
        );
        let original = build_dir.join(&entry.path);
        let request = CompressRequest {
            compressor: self.options.compressor,
            level: self.options.level,
            threads: self.options.threads,
        };
        let output = self.compressor.compress(&original, &request)?;

        ledger.advance(kind, ArtifactState::Verified);
        // Provenance describes the file just compressed, whatever an older
        // record claimed.
        let mut updated = entry.clone();
        updated.uncompressed_sha256 = Some(entry.sha256.clone());
        updated.uncompressed_size = Some(entry.size);
        updated.path = new_path;
        updated.sha256 = output.sha256.clone();
        updated.size = output.size;

        let target = build_dir.join(&updated.path);
        if let Err(e) = move_into_place(&output.temp_path, &target) {
            let _ = remove_if_present(&output.temp_path);
            return Err(e.context(format!(
                "Failed to move compressed output to {}",
                target.display()
            )));
        }
        sync_dir(build_dir)?;
        ledger.advance(kind, ArtifactState::Swapped);

        meta.images.insert(kind.to_string(), updated.clone());
        metadata::persist(build_dir, meta)?;
        ledger.advance(kind, ArtifactState::MetadataPersisted);

        if let Err(e) = remove_if_present(&original) {
            tracing::warn!(path = %original.display(), error = %e, "could not remove uncompressed original");
        }
        ledger.advance(kind, ArtifactState::OriginalRemoved);
        println!(
            "[compress:{label}] {} -> {} ({} -> {} bytes)",
            entry.path, updated.path, entry.size, updated.size
        );
        Ok(true)
    }

    /// Delete the pre-compression file left behind next to `path` by an
    /// interrupted run. Files still named by any entry are never touched.
    fn remove_stray_original(
        &self,
        build_dir: &Path,
        label: &str,
        meta: &BuildMetadata,
        path: &str,
    ) -> bool {
        let Some(stem) = self.catalog.strip_suffix(path) else {
            return false;
        };
        if meta.kind_for_path(stem).is_some() {
            return false;
        }
        let stray = build_dir.join(stem);
        match remove_if_present(&stray) {
            Ok(true) => {
                println!("[compress:{label}] removed leftover {stem}");
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(path = %stray.display(), error = %e, "could not remove leftover original");
                false
            }
        }
    }
}

struct Ledger {
    states: BTreeMap<String, ArtifactState>,
}

impl Ledger {
    fn advance(&mut self, kind: &str, next: ArtifactState) {
        let prev = self
            .states
            .insert(kind.to_string(), next)
            .unwrap_or(ArtifactState::Pending);
        debug_assert!(!prev.is_terminal(), "{kind} already finished as {prev:?}");
        tracing::debug!(kind, from = ?prev, to = ?next, "artifact state");
    }
}

/// `<build>/<arch>` for progress lines.
fn dir_label(build_dir: &Path) -> String {
    let mut parts: Vec<_> = build_dir
        .components()
        .rev()
        .take(2)
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.reverse();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::sha256_file;
    use crate::metadata::ImageEntry;
    use std::cell::Cell;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    /// Prefixes the input with a marker so output differs from input.
    #[derive(Default)]
    struct Tagging {
        calls: Cell<usize>,
        fail_on: Option<&'static str>,
    }

    impl CompressionBackend for Tagging {
        fn compress_stream(
            &self,
            input: &Path,
            request: &CompressRequest,
            out: &mut dyn Write,
        ) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if let Some(name) = self.fail_on {
                if input.ends_with(name) {
                    anyhow::bail!("exited with status 1");
                }
            }
            out.write_all(format!("{}:", request.compressor).as_bytes())?;
            out.write_all(&fs::read(input)?)?;
            Ok(())
        }
    }

    fn build_dir(tmp: &TempDir, images: &[(&str, &str, &str)]) -> PathBuf {
        let dir = tmp.path().join("builds/42.2/x86_64");
        fs::create_dir_all(&dir).unwrap();
        let mut meta = BuildMetadata::default();
        for (kind, path, bytes) in images {
            fs::write(dir.join(path), bytes).unwrap();
            let (sha, size) = sha256_file(&dir.join(path)).unwrap();
            meta.images
                .insert(kind.to_string(), ImageEntry::new(*path, sha, size));
        }
        metadata::persist(&dir, &meta).unwrap();
        dir
    }

    fn runner<'a>(
        catalog: &'a CompressionCatalog,
        tmp: &TempDir,
        backend: Tagging,
        options: RunOptions,
    ) -> CompressionRun<'a, Tagging> {
        CompressionRun::new(
            catalog,
            ArtifactCompressor::new(backend, tmp.path().join("tmp")),
            options,
        )
    }

    #[test]
    fn skip_set_wins_over_allow_list() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(
            &tmp,
            &[("ostree", "ostree.tar", "commit"), ("qemu", "disk.qcow2", "q")],
        );
        let catalog = CompressionCatalog::default();
        let options = RunOptions {
            allow_list: Some(["ostree".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let outcome = runner(&catalog, &tmp, Tagging::default(), options)
            .run_dir(&dir)
            .unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.states["ostree"], ArtifactState::SkippedByPolicy);
        assert_eq!(outcome.states["qemu"], ArtifactState::SkippedByPolicy);
        assert!(dir.join("ostree.tar").exists());
        assert!(dir.join("disk.qcow2").exists());
    }

    #[test]
    fn allow_list_limits_kinds() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(
            &tmp,
            &[("metal", "metal.raw", "m"), ("qemu", "disk.qcow2", "q")],
        );
        let catalog = CompressionCatalog::default();
        let options = RunOptions {
            allow_list: Some(["qemu".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let outcome = runner(&catalog, &tmp, Tagging::default(), options)
            .run_dir(&dir)
            .unwrap();

        assert_eq!(outcome.compressed().collect::<Vec<_>>(), vec!["qemu"]);
        let meta = metadata::load(&dir).unwrap();
        assert_eq!(meta.images["qemu"].path, "disk.qcow2.gz");
        assert_eq!(meta.images["metal"].path, "metal.raw");
    }

    #[test]
    fn failure_stops_run_and_keeps_earlier_progress() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(
            &tmp,
            &[
                ("aws", "aws.vmdk", "a"),
                ("metal", "metal.raw", "m"),
                ("qemu", "disk.qcow2", "q"),
            ],
        );
        let catalog = CompressionCatalog::default();
        let backend = Tagging {
            fail_on: Some("metal.raw"),
            ..Default::default()
        };
        let err = runner(&catalog, &tmp, backend, RunOptions::default())
            .run_dir(&dir)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompressError>(),
            Some(CompressError::CompressionFailed { .. })
        ));

        let meta = metadata::load(&dir).unwrap();
        assert_eq!(meta.images["aws"].path, "aws.vmdk.gz");
        assert!(!dir.join("aws.vmdk").exists());
        assert_eq!(meta.images["metal"].path, "metal.raw");
        assert_eq!(meta.images["qemu"].path, "disk.qcow2");
        assert!(dir.join("metal.raw").exists());
        assert!(!dir.join("metal.raw.gz").exists());
    }

    #[test]
    fn previous_compressor_suffix_is_respected() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(&tmp, &[("qemu", "disk.qcow2.xz", "xz-bytes")]);
        let before = fs::read(metadata::metadata_path(&dir)).unwrap();
        let catalog = CompressionCatalog::default();
        let backend = Tagging::default();
        let run = runner(&catalog, &tmp, backend, RunOptions::default());

        let outcome = run.run_dir(&dir).unwrap();
        assert_eq!(outcome.states["qemu"], ArtifactState::AlreadyCompressed);
        assert_eq!(run.compressor_calls(), 0);
        assert_eq!(fs::read(metadata::metadata_path(&dir)).unwrap(), before);
    }

    #[test]
    fn collision_with_other_entry_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(
            &tmp,
            &[("qemu", "disk.qcow2", "q"), ("qemu-gz", "disk.qcow2.gz", "z")],
        );
        let catalog = CompressionCatalog::default();
        let err = runner(&catalog, &tmp, Tagging::default(), RunOptions::default())
            .run_dir(&dir)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompressError>(),
            Some(CompressError::PathCollision { .. })
        ));
        assert!(dir.join("disk.qcow2").exists());
    }

    #[test]
    fn stray_named_by_another_entry_is_kept() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(
            &tmp,
            &[("ostree", "ostree.tar", "o"), ("ostree-gz", "ostree.tar.gz", "z")],
        );
        let catalog = CompressionCatalog::default();
        runner(&catalog, &tmp, Tagging::default(), RunOptions::default())
            .run_dir(&dir)
            .unwrap();
        assert!(dir.join("ostree.tar").exists());
    }

    #[test]
    fn missing_metadata_mutates_nothing() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("builds/42.2/x86_64");
        fs::create_dir_all(&dir).unwrap();
        let catalog = CompressionCatalog::default();
        let err = runner(&catalog, &tmp, Tagging::default(), RunOptions::default())
            .run_dir(&dir)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompressError>(),
            Some(CompressError::MetadataMissing { .. })
        ));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn provenance_describes_the_compressed_file() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(&tmp, &[("qemu", "disk.qcow2", "qcow2-bytes")]);
        let mut meta = metadata::load(&dir).unwrap();
        let original = meta.images["qemu"].clone();
        let entry = meta.images.get_mut("qemu").unwrap();
        entry.uncompressed_sha256 = Some("stale".to_string());
        entry.uncompressed_size = Some(1);
        metadata::persist(&dir, &meta).unwrap();

        let catalog = CompressionCatalog::default();
        runner(&catalog, &tmp, Tagging::default(), RunOptions::default())
            .run_dir(&dir)
            .unwrap();

        let qemu = &metadata::load(&dir).unwrap().images["qemu"];
        assert_eq!(qemu.path, "disk.qcow2.gz");
        assert_eq!(qemu.uncompressed_sha256.as_deref(), Some(original.sha256.as_str()));
        assert_eq!(qemu.uncompressed_size, Some(original.size));
    }

    #[test]
    fn skipped_kind_still_loses_its_leftover_original() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(
            &tmp,
            &[("metal", "metal.raw.gz", "gz-bytes"), ("qemu", "disk.qcow2", "q")],
        );
        fs::write(dir.join("metal.raw"), b"raw-bytes").unwrap();
        let before = fs::read(metadata::metadata_path(&dir)).unwrap();

        let catalog = CompressionCatalog::default();
        let options = RunOptions {
            allow_list: Some(["aws".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let run = runner(&catalog, &tmp, Tagging::default(), options);
        let outcome = run.run_dir(&dir).unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.states["metal"], ArtifactState::SkippedByPolicy);
        assert_eq!(outcome.states["qemu"], ArtifactState::SkippedByPolicy);
        assert_eq!(run.compressor_calls(), 0);
        assert!(!dir.join("metal.raw").exists());
        assert!(dir.join("metal.raw.gz").exists());
        assert!(dir.join("disk.qcow2").exists());
        assert_eq!(fs::read(metadata::metadata_path(&dir)).unwrap(), before);
    }

    #[test]
    fn abandoned_temp_files_are_swept() {
        let tmp = TempDir::new().unwrap();
        let dir = build_dir(&tmp, &[("qemu", "disk.qcow2.gz", "z")]);
        fs::write(dir.join(".meta.json-4242-1"), b"{\"images\"").unwrap();
        fs::write(dir.join(".disk.qcow2.gz.partial-4242-2"), b"half").unwrap();

        let catalog = CompressionCatalog::default();
        let outcome = runner(&catalog, &tmp, Tagging::default(), RunOptions::default())
            .run_dir(&dir)
            .unwrap();

        assert!(!outcome.changed);
        assert!(!dir.join(".meta.json-4242-1").exists());
        assert!(!dir.join(".disk.qcow2.gz.partial-4242-2").exists());
        assert_eq!(metadata::load(&dir).unwrap().images["qemu"].path, "disk.qcow2.gz");
    }

    #[test]
    fn label_is_build_and_arch() {
        assert_eq!(dir_label(Path::new("/srv/builds/42.2/x86_64")), "42.2/x86_64");
    }

    impl CompressionRun<'_, Tagging> {
        fn compressor_calls(&self) -> usize {
            self.compressor.backend().calls.get()
        }
    }
}
