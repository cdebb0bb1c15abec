//! Driver versions published for the running build.

use crate::download::{ArtifactDownloader, GPU_EXTENSION};
use crate::gpu::version::{get_gpu_driver_version, DEFAULT_VERSION, LATEST_VERSION};
use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::fmt;
use tracing::warn;

/// Version named by a signature artifact, for either naming scheme:
/// `<version>.signature.tar.gz` or `nvidia-drivers-<version>-signature.tar.gz`.
pub fn version_from_signature_name(name: &str) -> Option<&str> {
    let version = name
        .strip_suffix(".signature.tar.gz")
        .or_else(|| {
            name.strip_prefix("nvidia-drivers-")?
                .strip_suffix("-signature.tar.gz")
        })?;
    (!version.is_empty() && version.split('.').all(|p| p.parse::<u32>().is_ok())).then_some(version)
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let key = |v: &str| -> Vec<u32> { v.split('.').filter_map(|p| p.parse().ok()).collect() };
    key(a).cmp(&key(b))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverListing {
    /// Ascending, without duplicates.
    pub versions: Vec<String>,
    pub default: String,
    pub latest: Option<String>,
}

impl fmt::Display for DriverListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for version in &self.versions {
            write!(f, "{}", version)?;
            if *version == self.default {
                write!(f, " [default]")?;
            }
            if self.latest.as_deref() == Some(version.as_str()) {
                write!(f, " [latest]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Versions with a published signature, plus the default and latest markers.
pub fn list_drivers(downloader: &dyn ArtifactDownloader) -> Result<DriverListing> {
    let names = downloader
        .list_extension_artifacts(GPU_EXTENSION)
        .context("Failed to list GPU driver artifacts")?;
    let mut versions: Vec<String> = names
        .iter()
        .filter_map(|n| version_from_signature_name(n))
        .map(str::to_string)
        .collect();
    versions.sort_by(|a, b| compare_versions(a, b));
    versions.dedup();

    let default = get_gpu_driver_version(downloader, DEFAULT_VERSION)
        .context("Failed to get the default GPU driver version")?;
    let latest = match get_gpu_driver_version(downloader, LATEST_VERSION) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Failed to get the latest GPU driver version: {:#}", e);
            None
        }
    };

    Ok(DriverListing {
        versions,
        default,
        latest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::testing::FakeDownloader;

    #[test]
    fn test_both_signature_schemes() {
        assert_eq!(version_from_signature_name("535.104.12.signature.tar.gz"), Some("535.104.12"));
        assert_eq!(
            version_from_signature_name("nvidia-drivers-470.223.02-signature.tar.gz"),
            Some("470.223.02")
        );
        assert_eq!(version_from_signature_name("nvidia-open-kernel-modules-535.104.12.tar.gz"), None);
        assert_eq!(version_from_signature_name("gpu_default_version"), None);
    }

    #[test]
    fn test_listing_sorted_and_annotated() -> Result<()> {
        let d = FakeDownloader::new()
            .with_extension_artifact("gpu", "535.104.12.signature.tar.gz", b"")
            .with_extension_artifact("gpu", "nvidia-drivers-470.223.02-signature.tar.gz", b"")
            .with_extension_artifact("gpu", "535.104.5.signature.tar.gz", b"")
            .with_extension_artifact("gpu", "nvidia-drivers-535.104.12-signature.tar.gz", b"")
            .with_artifact("gpu_default_version", b"535.104.12\n")
            .with_artifact("gpu_latest_version", b"535.104.12");

        let listing = list_drivers(&d)?;
        assert_eq!(listing.versions, vec!["470.223.02", "535.104.5", "535.104.12"]);
        assert_eq!(
            listing.to_string(),
            "470.223.02\n535.104.5\n535.104.12 [default] [latest]\n"
        );
        Ok(())
    }

    #[test]
    fn test_missing_latest_marker_only_warns() -> Result<()> {
        let d = FakeDownloader::new()
            .with_extension_artifact("gpu", "470.223.02.signature.tar.gz", b"")
            .with_artifact("gpu_default_version", b"470.223.02");
        let listing = list_drivers(&d)?;
        assert_eq!(listing.latest, None);
        assert_eq!(listing.to_string(), "470.223.02 [default]\n");
        Ok(())
    }

    #[test]
    fn test_missing_default_marker_fails() {
        let d = FakeDownloader::new().with_extension_artifact("gpu", "470.223.02.signature.tar.gz", b"");
        assert!(list_drivers(&d).is_err());
    }
}
