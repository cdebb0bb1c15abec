//! Vendor installer handling outside of module linking.

use crate::archive::unpack_tar_gz;
use crate::linker::{collect_into, installer_command};
use crate::process::{Cmd, ProcessRunner};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Unpack the self-extracting installer into `extract_dir`.
///
/// The directory is recreated so that stale objects from an earlier run
/// never end up in the modules.
pub fn extract_installer(runner: &dyn ProcessRunner, installer: &Path, extract_dir: &Path) -> Result<()> {
    info!("Extracting GPU driver installer {}", installer.display());
    if extract_dir.exists() {
        fs::remove_dir_all(extract_dir)
            .with_context(|| format!("Failed to remove {}", extract_dir.display()))?;
    }
    Cmd::new("sh")
        .arg_path(installer)
        .arg("-x")
        .arg("--target")
        .arg_path(extract_dir)
        .error_msg(format!("Failed to extract {}", installer.display()))
        .run(runner)?;
    Ok(())
}

/// Install the userspace libraries and utilities without touching kernel
/// modules.
pub fn install_userspace(runner: &dyn ProcessRunner, extract_dir: &Path, container_dir: &Path) -> Result<()> {
    info!("Installing GPU driver userspace components");
    installer_command(extract_dir, container_dir)
        .arg("--no-kernel-module")
        .error_msg("Failed to install GPU driver userspace components")
        .run(runner)?;
    Ok(())
}

/// Unpack a prebuilt module bundle and move its modules into `drivers_dir`.
pub fn install_prebuilt_modules(bundle: &Path, staging: &Path, drivers_dir: &Path) -> Result<Vec<PathBuf>> {
    info!("Installing prebuilt kernel modules from {}", bundle.display());
    if staging.exists() {
        fs::remove_dir_all(staging)
            .with_context(|| format!("Failed to remove {}", staging.display()))?;
    }
    unpack_tar_gz(bundle, staging)?;
    let modules = collect_into(staging, drivers_dir)?;
    if modules.is_empty() {
        anyhow::bail!("Bundle {} contains no kernel modules", bundle.display());
    }
    Ok(modules)
}

/// Put the signing certificate where the cached path will find it.
pub fn install_public_key(der: &Path, dest: &Path) -> Result<()> {
    fs::copy(der, dest)
        .with_context(|| format!("Failed to copy {} to {}", der.display(), dest.display()))?;
    Ok(())
}

/// Check that the installed driver talks to the GPU.
pub fn verify(runner: &dyn ProcessRunner, container_dir: &Path) -> Result<()> {
    info!("Verifying GPU driver installation");
    let inherited = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    let path = format!("{}:{}", container_dir.join("bin").display(), inherited);

    Cmd::new("nvidia-smi")
        .env("PATH", &path)
        .error_msg("Failed to verify GPU driver installation")
        .run(runner)?;
    Cmd::new("nvidia-modprobe")
        .args(["-c0", "-u"])
        .env("PATH", &path)
        .error_msg("Failed to create device files for the unified memory module")
        .run(runner)?;
    info!("GPU driver installation verified");
    Ok(())
}
