//! Produce a compressed copy of one image in a scratch directory.
//!
//! The actual compression is delegated to a [`CompressionBackend`]; the
//! production backend pipes the image through the host `gzip`, `xz` or `zstd`
//! binary. Output never lands next to the image: it is written under the
//! scratch directory and only moved into the build directory by the run,
//! after its digest and size have been computed here.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::catalog::{CompressionLevel, Compressor};
use crate::error::CompressError;
use crate::files::{sha256_file, tmp_name};

/// Parameters for a single compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressRequest {
    pub compressor: Compressor,
    pub level: CompressionLevel,
    /// Worker thread hint; 0 leaves the choice to the compressor.
    pub threads: u32,
}

/// Something that can turn an input file into a compressed byte stream.
pub trait CompressionBackend {
    fn compress_stream(
        &self,
        input: &Path,
        request: &CompressRequest,
        out: &mut dyn Write,
    ) -> Result<()>;
}

/// Runs the compressor binary found on `PATH` and captures its stdout.
#[derive(Debug, Clone, Default)]
pub struct CommandBackend;

impl CommandBackend {
    /// Host binary for a compressor.
    pub fn program(compressor: Compressor) -> &'static str {
        match compressor {
            Compressor::Gzip => "gzip",
            Compressor::Xz => "xz",
            Compressor::Zstd => "zstd",
        }
    }

    pub fn command(input: &Path, request: &CompressRequest) -> Command {
        let mut cmd = Command::new(Self::program(request.compressor));
        cmd.arg("-c");
        let fast = request.level == CompressionLevel::Fast;
        match request.compressor {
            Compressor::Gzip => {
                // gzip is single-threaded; there is no -T.
                cmd.arg(if fast { "-1" } else { "-9" });
            }
            Compressor::Xz => {
                cmd.arg(if fast { "-0" } else { "-9" });
                if request.threads > 0 {
                    cmd.arg(format!("-T{}", request.threads));
                }
            }
            Compressor::Zstd => {
                cmd.arg(if fast { "-3" } else { "-10" });
                cmd.arg("-q");
                if request.threads > 0 {
                    cmd.arg(format!("-T{}", request.threads));
                }
            }
        }
        cmd.arg(input);
        cmd
    }
}

impl CompressionBackend for CommandBackend {
    fn compress_stream(
        &self,
        input: &Path,
        request: &CompressRequest,
        out: &mut dyn Write,
    ) -> Result<()> {
        let mut cmd = Self::command(input, request);
        tracing::debug!(command = ?cmd, "spawning compressor");
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", Self::program(request.compressor)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("compressor stdout was not captured"))?;
        let copied = io::copy(&mut stdout, out);
        // A child blocked on a full pipe never exits on its own.
        drop(stdout);
        if copied.is_err() {
            let _ = child.kill();
        }
        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for {}", Self::program(request.compressor)))?;
        copied.context("Failed to read compressor output")?;

        if !status.success() {
            anyhow::bail!(
                "{} exited with status {}",
                Self::program(request.compressor),
                status
            );
        }
        Ok(())
    }
}

/// A finished, verified compressed file waiting in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedArtifact {
    pub temp_path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

pub struct ArtifactCompressor<B: CompressionBackend> {
    backend: B,
    scratch_dir: PathBuf,
}

impl<B: CompressionBackend> ArtifactCompressor<B> {
    /// `scratch_dir` must not be a build directory.
    pub fn new(backend: B, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn compress(&self, input: &Path, request: &CompressRequest) -> Result<CompressedArtifact> {
        let failed = |reason: String| CompressError::CompressionFailed {
            path: input.to_path_buf(),
            reason,
        };

        if let Err(e) = File::open(input) {
            return Err(failed(format!("input is unreadable: {e}")).into());
        }
        fs::create_dir_all(&self.scratch_dir).with_context(|| {
            format!("Failed to create scratch directory {}", self.scratch_dir.display())
        })?;

        let stem = input
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("image");
        let mut scratch = ScratchFile {
            path: self
                .scratch_dir
                .join(tmp_name(&format!("{stem}.{}", request.compressor))),
            keep: false,
        };

        let written = self
            .write_output(input, request, &scratch.path)
            .map_err(|e| failed(format!("{e:#}")))?;
        if written == 0 {
            return Err(failed("compressor produced no output".to_string()).into());
        }

        let (sha256, size) = sha256_file(&scratch.path)?;
        if size != written {
            return Err(CompressError::VerificationMismatch {
                path: scratch.path.clone(),
                expected: format!("{written} bytes"),
                actual: format!("{size} bytes"),
            }
            .into());
        }

        scratch.keep = true;
        Ok(CompressedArtifact {
            temp_path: scratch.path.clone(),
            sha256,
            size,
        })
    }

    fn write_output(&self, input: &Path, request: &CompressRequest, dest: &Path) -> Result<u64> {
        let file = File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut out = CountingWriter {
            inner: BufWriter::new(file),
            count: 0,
        };
        self.backend.compress_stream(input, request, &mut out)?;
        out.flush()?;
        let file = out
            .inner
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush {}: {}", dest.display(), e.error()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", dest.display()))?;
        Ok(out.count)
    }
}

/// Removes a scratch output on drop unless it was handed off.
struct ScratchFile {
    path: PathBuf,
    keep: bool,
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
