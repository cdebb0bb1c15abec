//! Preflight checks for the install command.
//!
//! Validates that the installer environment has the tools the pipeline shells
//! out to, so a missing binary fails up front instead of halfway through a
//! mounted layout.
//!
//! # Example
//!
//! ```rust,ignore
//! use gpu_driver_installer::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("insmod") {
//!     println!("kmod not installed");
//! }
//!
//! let tools = &[("curl", "curl"), ("keyctl", "keyutils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command resolves on `PATH` (or is an existing absolute path).
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every install needs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("curl", "curl"),
    ("tar", "tar"),
    ("sh", "bash"),
    ("lspci", "pciutils"),
    ("insmod", "kmod"),
    ("ldconfig", "libc-bin"),
    ("/bin/keyctl", "keyutils"),
];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
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
        bail!("Missing required tools:\n{}", msg);
    }

    Ok(())
}

/// Check every tool in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
