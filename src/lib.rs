//! Resumable compression of the disk images produced by a build.
//!
//! A build directory holds image files plus a `meta.json` record of their
//! names, digests and sizes. This crate replaces each eligible image with a
//! compressed copy while keeping `meta.json` truthful at every instant, so a
//! run can be killed anywhere and simply started again.
//!
//! - **Catalog** - which kinds are never compressed, suffix per compressor
//! - **Threads** - compressor thread budget from container CPU limits
//! - **Compressor** - compress one image into scratch space and hash it
//! - **Metadata** - load and atomically persist `meta.json`
//! - **Run** - the per-artifact state machine tying it together
//!
//! # Architecture
//!
//! ```text
//! build-compress (bin)
//!     │
//!     ├── BuildsDir ──────────> build dirs for <id>/<arch>
//!     ├── ThreadBudgetEstimator
//!     └── CompressionRun
//!             ├── CompressionCatalog   (skip / suffix policy)
//!             ├── ArtifactCompressor   (scratch output + sha256)
//!             └── metadata             (meta.json, temp + rename)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use build_compress::{
//!     ArtifactCompressor, CommandBackend, CompressionCatalog, CompressionRun, RunOptions,
//! };
//!
//! let catalog = CompressionCatalog::default();
//! let compressor = ArtifactCompressor::new(CommandBackend, "tmp/compress");
//! let run = CompressionRun::new(&catalog, compressor, RunOptions::default());
//! run.run_dir(Path::new("builds/42.2/x86_64"))?;
//! ```

pub mod builds;
pub mod catalog;
pub mod compressor;
pub mod error;
pub mod files;
pub mod lock;
pub mod metadata;
pub mod preflight;
pub mod run;
pub mod threads;

pub use builds::{BuildLocator, BuildsDir};
pub use catalog::{CompressionCatalog, CompressionLevel, Compressor};
pub use compressor::{ArtifactCompressor, CommandBackend, CompressRequest, CompressionBackend};
pub use error::CompressError;
pub use metadata::{BuildMetadata, ImageEntry};
pub use run::{ArtifactState, CompressionRun, DirOutcome, RunOptions};
pub use threads::{ConstraintProbe, HostProbe, ThreadBudgetEstimator};
