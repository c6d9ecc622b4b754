//! Preflight checks for signing.
//!
//! Validates that the host has the signing tools before any generation is
//! staged. A missing `sbsign` discovered halfway through an install would
//! leave every generation failed at the sign stage with the same message.
//!
//! # Example
//!
//! ```rust
//! use sb_install::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("sbsign") {
//!     println!("sbsigntool not installed");
//! }
//!
//! let tools = &[("sbsign", "sbsigntool"), ("sbverify", "sbsigntool")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the `sbsign` signer shells out to.
///
/// Each tuple is (command_name, package_name).
pub const SIGNING_TOOLS: &[(&str, &str)] = &[("sbsign", "sbsigntool"), ("sbverify", "sbsigntool")];

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and the package providing it.
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

/// Check that the signing tools in [`SIGNING_TOOLS`] are available.
pub fn check_signing_tools() -> Result<()> {
    check_required_tools(SIGNING_TOOLS)
}
