//! Preflight checks for a compression run.
//!
//! Validates that the host has the compressor binary before any artifact is
//! touched, so a missing tool fails up front instead of on the first image.
//!
//! # Example
//!
//! ```rust
//! use build_compress::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("zstd") {
//!     println!("zstd not installed");
//! }
//!
//! let tools = &[("gzip", "gzip"), ("xz", "xz")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::catalog::Compressor;
use crate::compressor::CommandBackend;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host package providing each compressor binary.
pub fn package_for(compressor: Compressor) -> &'static str {
    match compressor {
        Compressor::Gzip => "gzip",
        Compressor::Xz => "xz",
        Compressor::Zstd => "zstd",
    }
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package). Returns an error listing every missing
/// tool with the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the tool needed by [`CommandBackend`] for `compressor`.
pub fn check_compressor(compressor: Compressor) -> Result<()> {
    check_required_tools(&[(CommandBackend::program(compressor), package_for(compressor))])
}
