//! Driver version resolution.
//!
//! A symbolic request (empty for the default, `latest`) is turned into a
//! concrete version by reading a marker artifact published next to the build.
//! The result is then checked against the GPU model's
//! [fallback rule](super::FallbackRule) and replaced at most once.

use super::{fallback_rule, GpuModel};
use crate::download::ArtifactDownloader;
use anyhow::{bail, Context, Result};
use tracing::{info, warn};

pub const DEFAULT_VERSION: &str = "";
pub const LATEST_VERSION: &str = "latest";

/// Major component of a dotted driver version.
pub fn major_version(version: &str) -> Result<u32> {
    let major = version.split('.').next().unwrap_or_default();
    major
        .parse()
        .with_context(|| format!("Invalid driver version {:?}", version))
}

/// Marker artifact that names the concrete version for an alias.
///
/// `""` → `gpu_default_version`, `latest` → `gpu_latest_version`,
/// `R470` → `gpu_R470_version`.
pub fn marker_name(alias: &str) -> String {
    match alias {
        DEFAULT_VERSION => "gpu_default_version".to_string(),
        LATEST_VERSION => "gpu_latest_version".to_string(),
        other => format!("gpu_{}_version", other),
    }
}

fn fetch_marker(downloader: &dyn ArtifactDownloader, alias: &str) -> Result<String> {
    let marker = marker_name(alias);
    let content = downloader
        .get_artifact(&marker)
        .with_context(|| format!("Failed to get GPU driver version from {}", marker))?;
    let version = String::from_utf8_lossy(&content).trim().to_string();
    if version.is_empty() {
        bail!("Marker {} is empty", marker);
    }
    Ok(version)
}

/// Resolve the empty string and `latest` through their markers; any other
/// input is already concrete and returned unchanged.
pub fn get_gpu_driver_version(downloader: &dyn ArtifactDownloader, requested: &str) -> Result<String> {
    match requested {
        DEFAULT_VERSION => {
            info!("Getting the default GPU driver version");
            fetch_marker(downloader, requested)
        }
        LATEST_VERSION => {
            info!("Getting the latest GPU driver version");
            fetch_marker(downloader, requested)
        }
        concrete => Ok(concrete.to_string()),
    }
}

/// Replace `version` with the model's fallback family when it lies outside
/// the supported window.
pub fn check_driver_compatibility(
    downloader: &dyn ArtifactDownloader,
    model: GpuModel,
    version: &str,
) -> Result<String> {
    let major = major_version(version)?;
    let Some(rule) = fallback_rule(model) else {
        return Ok(version.to_string());
    };
    if rule.allows(major) {
        return Ok(version.to_string());
    }

    warn!(
        "Driver {} is not supported on {} GPUs; falling back to the {} family",
        version, model, rule.replacement
    );
    let replacement = fetch_marker(downloader, rule.replacement)?;
    major_version(&replacement)?;
    info!("Using driver {} for {} GPUs", replacement, model);
    Ok(replacement)
}

/// Full resolution: symbolic lookup followed by the compatibility check.
pub fn resolve_driver_version(
    downloader: &dyn ArtifactDownloader,
    model: GpuModel,
    requested: &str,
) -> Result<String> {
    let version = get_gpu_driver_version(downloader, requested)?;
    check_driver_compatibility(downloader, model, &version)
}
