//! Where driver installers and prebuilt module bundles come from.

use crate::download::{file_name, ArtifactDownloader, GPU_EXTENSION};
use crate::errors::is_not_found;
use crate::host::HostEnv;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STORAGE_HOST: &str = "https://storage.googleapis.com";
const INSTALLER_PREFIX: &str = "NVIDIA-Linux-x86_64-";

/// Regional download location for an instance zone.
///
/// Accepts either a bare zone (`europe-west4-a`) or the metadata form
/// (`projects/<n>/zones/europe-west4-a`).
pub fn installer_download_location(zone: &str) -> &'static str {
    let zone = zone.trim().rsplit('/').next().unwrap_or_default();
    match zone.split('-').next().unwrap_or_default() {
        "us" => "us",
        "asia" => "asia",
        "europe" => "eu",
        _ => "us",
    }
}

/// Installer prebuilt for one OS build.
pub fn precompiled_installer_url(version: &str, milestone: &str, build: &str, location: &str) -> String {
    let major = version.split('.').next().unwrap_or(version);
    format!(
        "{host}/nvidia-drivers-{loc}-public/nvidia-cos-project/{ms}/tesla/{major}_00/{v}/{prefix}{v}_{ms}-{build}.cos",
        host = STORAGE_HOST,
        loc = location,
        ms = milestone,
        major = major,
        v = version,
        prefix = INSTALLER_PREFIX,
        build = build.replace('.', "-"),
    )
}

/// Distribution-agnostic installer, used for userspace with prebuilt modules.
pub fn generic_installer_url(version: &str) -> String {
    format!(
        "{}/nvidia-drivers-us-public/tesla/{v}/{}{v}.run",
        STORAGE_HOST,
        INSTALLER_PREFIX,
        v = version
    )
}

/// Driver version encoded in an installer file name.
///
/// `NVIDIA-Linux-x86_64-535.104.12.run` and
/// `NVIDIA-Linux-x86_64-535.104.12_105-17412-226-28.cos` both give
/// `535.104.12`.
pub fn version_from_installer_url(url: &str) -> Option<String> {
    let name = file_name(url).strip_prefix(INSTALLER_PREFIX)?;
    let stem = name
        .strip_suffix(".run")
        .or_else(|| name.strip_suffix(".cos"))?;
    let version = stem.split('_').next()?;
    (!version.is_empty() && version.split('.').all(|p| p.parse::<u32>().is_ok()))
        .then(|| version.to_string())
}

/// Name of the open module bundle in the gpu extension.
pub fn prebuilt_bundle_name(version: &str) -> String {
    format!("nvidia-open-kernel-modules-{}.tar.gz", version)
}

/// Fetch the installer for `version` built for the running OS build.
pub fn download_driver_installer(
    downloader: &dyn ArtifactDownloader,
    host: &HostEnv,
    version: &str,
    dest: &Path,
) -> Result<PathBuf> {
    info!("Downloading GPU driver installer version {}", version);
    let location = match downloader.instance_zone() {
        Ok(zone) => installer_download_location(&zone),
        Err(e) => {
            warn!("Could not read instance zone, using the us location: {:#}", e);
            "us"
        }
    };
    let url = precompiled_installer_url(version, host.milestone(), host.build_number(), location);
    downloader
        .download_url(&url, dest)
        .with_context(|| format!("Failed to download GPU driver installer version {}", version))
}

pub fn download_generic_installer(
    downloader: &dyn ArtifactDownloader,
    version: &str,
    dest: &Path,
) -> Result<PathBuf> {
    let url = generic_installer_url(version);
    downloader
        .download_url(&url, dest)
        .with_context(|| format!("Failed to download GPU driver installer from {}", url))
}

/// The open module bundle for `version`, or `None` when none is published.
pub fn download_prebuilt_bundle(
    downloader: &dyn ArtifactDownloader,
    version: &str,
    dest: &Path,
) -> Result<Option<PathBuf>> {
    let name = prebuilt_bundle_name(version);
    match downloader.download_extension_artifact(dest, GPU_EXTENSION, &name) {
        Ok(path) => {
            info!("Using prebuilt open kernel modules {}", name);
            Ok(Some(path))
        }
        Err(e) if is_not_found(&e) => {
            info!("No prebuilt open kernel modules for {}", version);
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to download {}", name)),
    }
}
