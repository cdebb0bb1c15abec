//! Artifact download from object storage.
//!
//! Build artifacts (version markers, toolchain, kernel headers, signatures,
//! prebuilt module bundles) are published per build in a public bucket, with
//! an internal staging bucket as an optional fallback. [`GcsDownloader`] talks
//! to storage through `curl`, executed by the injected
//! [`ProcessRunner`](crate::process::ProcessRunner).
//!
//! Retry and backoff are left to the caller.

mod gcs;

pub use gcs::{GcsDownloader, COS_TOOLS_BUCKET, INTERNAL_BUCKET};

use anyhow::Result;
use std::path::{Path, PathBuf};

pub const TOOLCHAIN_ARCHIVE: &str = "toolchain.tar.xz";
pub const TOOLCHAIN_URL: &str = "toolchain_url";
pub const TOOLCHAIN_ENV: &str = "toolchain_env";
pub const KERNEL_HEADERS: &str = "kernel-headers.tgz";
pub const GPU_EXTENSION: &str = "gpu";

/// Source of per-build artifacts.
///
/// Every `download_*` method writes into `dest` (a directory) and returns the
/// path of the written file. A missing object is reported as
/// [`InstallError::ArtifactNotFound`](crate::errors::InstallError::ArtifactNotFound)
/// somewhere in the error chain.
pub trait ArtifactDownloader {
    fn download_artifact(&self, dest: &Path, name: &str) -> Result<PathBuf>;

    /// Contents of a small artifact, e.g. a version marker.
    fn get_artifact(&self, name: &str) -> Result<Vec<u8>>;

    fn download_toolchain(&self, dest: &Path) -> Result<PathBuf>;

    fn download_kernel_headers(&self, dest: &Path) -> Result<PathBuf> {
        self.download_artifact(dest, KERNEL_HEADERS)
    }

    fn download_toolchain_env(&self, dest: &Path) -> Result<PathBuf> {
        self.download_artifact(dest, TOOLCHAIN_ENV)
    }

    fn download_extension_artifact(&self, dest: &Path, extension: &str, name: &str) -> Result<PathBuf> {
        self.download_artifact(dest, &extension_path(extension, name))
    }

    /// Artifact names (relative to the extension dir) published for `extension`.
    fn list_extension_artifacts(&self, extension: &str) -> Result<Vec<String>>;

    /// Fetch an arbitrary URL into `dest`, keeping the URL's file name.
    fn download_url(&self, url: &str, dest: &Path) -> Result<PathBuf>;

    /// Zone of the instance the installer runs on, e.g.
    /// `projects/123/zones/us-central1-a`.
    fn instance_zone(&self) -> Result<String>;
}

pub fn extension_path(extension: &str, name: &str) -> String {
    format!("extensions/{}/{}", extension, name)
}

/// Last path segment of an object name or URL.
pub fn file_name(name: &str) -> &str {
    let name = name.split(['?', '#']).next().unwrap_or(name);
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory downloader for unit tests.

    use super::*;
    use crate::errors::InstallError;
    use anyhow::Context;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeDownloader {
        artifacts: HashMap<String, Vec<u8>>,
        urls: HashMap<String, Vec<u8>>,
        zone: Option<String>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeDownloader {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_artifact(mut self, name: &str, contents: &[u8]) -> Self {
            self.artifacts.insert(name.to_string(), contents.to_vec());
            self
        }

        pub(crate) fn with_extension_artifact(self, extension: &str, name: &str, contents: &[u8]) -> Self {
            self.with_artifact(&extension_path(extension, name), contents)
        }

        pub(crate) fn with_url(mut self, url: &str, contents: &[u8]) -> Self {
            self.urls.insert(url.to_string(), contents.to_vec());
            self
        }

        pub(crate) fn with_zone(mut self, zone: &str) -> Self {
            self.zone = Some(zone.to_string());
            self
        }

        /// Every artifact name and URL asked for, in order.
        pub(crate) fn requested(&self) -> Vec<String> {
            self.requested.lock().map(|r| r.clone()).unwrap_or_default()
        }

        fn record(&self, what: &str) {
            if let Ok(mut requested) = self.requested.lock() {
                requested.push(what.to_string());
            }
        }

        fn write(&self, dest: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
            fs::create_dir_all(dest)?;
            let path = dest.join(file_name(name));
            fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
            Ok(path)
        }
    }

    impl ArtifactDownloader for FakeDownloader {
        fn download_artifact(&self, dest: &Path, name: &str) -> Result<PathBuf> {
            self.record(name);
            let contents = self
                .artifacts
                .get(name)
                .ok_or_else(|| InstallError::ArtifactNotFound(name.to_string()))?;
            self.write(dest, name, contents)
        }

        fn get_artifact(&self, name: &str) -> Result<Vec<u8>> {
            self.record(name);
            self.artifacts
                .get(name)
                .cloned()
                .ok_or_else(|| InstallError::ArtifactNotFound(name.to_string()).into())
        }

        fn download_toolchain(&self, dest: &Path) -> Result<PathBuf> {
            self.download_artifact(dest, TOOLCHAIN_ARCHIVE)
        }

        fn list_extension_artifacts(&self, extension: &str) -> Result<Vec<String>> {
            let prefix = extension_path(extension, "");
            let mut names: Vec<String> = self
                .artifacts
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                .collect();
            names.sort();
            Ok(names)
        }

        fn download_url(&self, url: &str, dest: &Path) -> Result<PathBuf> {
            self.record(url);
            let contents = self
                .urls
                .get(url)
                .ok_or_else(|| InstallError::ArtifactNotFound(url.to_string()))?;
            self.write(dest, url, contents)
        }

        fn instance_zone(&self) -> Result<String> {
            self.zone
                .clone()
                .ok_or_else(|| anyhow::anyhow!("metadata server unavailable"))
        }
    }
}
