use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use build_compress::{
    preflight, ArtifactCompressor, BuildLocator, BuildsDir, CommandBackend, CompressionCatalog,
    CompressionLevel, CompressionRun, Compressor, RunOptions, ThreadBudgetEstimator,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_BUILDS_DIR: &str = "builds";
const LOG_ENV: &str = "BUILD_COMPRESS_LOG";

fn usage() -> &'static str {
    "Usage:\n  build-compress [--build <id>] [--artifact <kind>]... [--compressor gzip|xz|zstd]\n                 [--fast] [--builds-dir <dir>] [--workdir <dir>] [--config <file>]\n\n\
     Compresses the disk images of a build (default: the latest) in place,\n\
     keeping meta.json consistent. Safe to re-run after an interruption."
}

#[derive(Debug, PartialEq)]
struct CliArgs {
    build: Option<String>,
    artifacts: Vec<String>,
    compressor: Compressor,
    level: CompressionLevel,
    builds_dir: PathBuf,
    workdir: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            build: None,
            artifacts: Vec::new(),
            compressor: Compressor::default(),
            level: CompressionLevel::default(),
            builds_dir: PathBuf::from(DEFAULT_BUILDS_DIR),
            workdir: None,
            config: None,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(cli) = parse_args(&args)? else {
        println!("{}", usage());
        return Ok(());
    };

    let catalog = match &cli.config {
        Some(path) => CompressionCatalog::load(path)?,
        None => CompressionCatalog::default(),
    };
    preflight::check_compressor(cli.compressor)?;

    let builds = BuildsDir::new(&cli.builds_dir);
    let build_dirs = builds
        .build_dirs(cli.build.as_deref())
        .context("Failed to resolve build directories")?;

    let threads = ThreadBudgetEstimator::default().estimate();
    if threads > 0 {
        println!("[compress] CPU quota detected; using {threads} compressor threads");
    }

    let workdir = cli
        .workdir
        .clone()
        .unwrap_or_else(|| default_workdir(&cli.builds_dir));
    fs::create_dir_all(&workdir)
        .with_context(|| format!("Failed to create work directory {}", workdir.display()))?;
    let scratch = tempfile::Builder::new()
        .prefix(".build-compress-")
        .tempdir_in(&workdir)
        .with_context(|| {
            format!("Failed to create scratch directory in {}", workdir.display())
        })?;

    let allow_list = (!cli.artifacts.is_empty())
        .then(|| cli.artifacts.iter().cloned().collect::<BTreeSet<_>>());
    let options = RunOptions {
        compressor: cli.compressor,
        level: cli.level,
        threads,
        allow_list,
    };
    let run = CompressionRun::new(
        &catalog,
        ArtifactCompressor::new(CommandBackend, scratch.path()),
        options,
    );

    for outcome in run.run(&build_dirs)? {
        let status = if outcome.changed {
            "updated"
        } else {
            "nothing to do"
        };
        println!("[compress] {}: {status}", outcome.build_dir.display());
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Scratch space sits next to the builds root so renames stay on one filesystem.
fn default_workdir(builds_dir: &Path) -> PathBuf {
    builds_dir
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("tmp")
}

/// Returns `None` when help was requested.
fn parse_args(args: &[String]) -> Result<Option<CliArgs>> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f, Some(v.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = |name: &str| -> Result<String> {
            match inline.clone().or_else(|| iter.next().cloned()) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => bail!("missing value for {name}\n\n{}", usage()),
            }
        };

        match flag {
            "-h" | "--help" => return Ok(None),
            "--build" => cli.build = Some(value(flag)?),
            "--artifact" => cli.artifacts.push(value(flag)?),
            "--compressor" => cli.compressor = value(flag)?.parse()?,
            "--builds-dir" => cli.builds_dir = PathBuf::from(value(flag)?),
            "--workdir" => cli.workdir = Some(PathBuf::from(value(flag)?)),
            "--config" => cli.config = Some(PathBuf::from(value(flag)?)),
            "--fast" if inline.is_none() => cli.level = CompressionLevel::Fast,
            other => bail!("unexpected argument '{}'\n\n{}", other, usage()),
        }
    }

    Ok(Some(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults() {
        let cli = parse_args(&[]).unwrap().unwrap();
        assert_eq!(cli, CliArgs::default());
        assert_eq!(cli.compressor, Compressor::Gzip);
    }

    #[test]
    fn repeated_artifacts_and_inline_values() {
        let cli = parse_args(&args(&[
            "--build",
            "42.2",
            "--artifact",
            "qemu",
            "--artifact=metal",
            "--compressor=zstd",
            "--fast",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(cli.build.as_deref(), Some("42.2"));
        assert_eq!(cli.artifacts, vec!["qemu", "metal"]);
        assert_eq!(cli.compressor, Compressor::Zstd);
        assert_eq!(cli.level, CompressionLevel::Fast);
    }

    #[test]
    fn rejects_unknown_and_incomplete() {
        assert!(parse_args(&args(&["--compressor", "lz4"])).is_err());
        assert!(parse_args(&args(&["--build"])).is_err());
        assert!(parse_args(&args(&["qemu"])).is_err());
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
    }

    #[test]
    fn workdir_defaults_beside_builds() {
        assert_eq!(
            default_workdir(Path::new("/srv/fcos/builds")),
            PathBuf::from("/srv/fcos/tmp")
        );
        assert_eq!(default_workdir(Path::new("builds")), PathBuf::from("tmp"));
    }
}
