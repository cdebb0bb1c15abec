//! Record of the last successful install.
//!
//! The record lives in the host install dir so it survives reboots. A
//! matching record lets the next run skip download and compilation and only
//! re-create mounts and reload modules.
//!
//! File format (`KEY=VALUE` lines):
//!
//! ```text
//! BUILD_ID=11647.415.0
//! DRIVER_VERSION=418.67
//! KERNEL_OPEN=Y
//! KERNEL_OPEN_REQUESTED=Y
//! ```
//!
//! `KERNEL_OPEN=Y` is present only when the open module flavour was installed.
//! `KERNEL_OPEN_REQUESTED=Y` records that the run asked for open modules,
//! which it may not have received when no prebuilt bundle was published.
//! A record only matches a run that asks for the same flavour.

use crate::host::parse_env_file;
use anyhow::{Context, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CACHE_FILE: &str = ".cache";

const BUILD_ID_KEY: &str = "BUILD_ID";
const DRIVER_VERSION_KEY: &str = "DRIVER_VERSION";
const KERNEL_OPEN_KEY: &str = "KERNEL_OPEN";
const KERNEL_OPEN_REQUESTED_KEY: &str = "KERNEL_OPEN_REQUESTED";

/// Install-state cache for one (build, driver version) pair.
#[derive(Debug, Clone)]
pub struct InstallCache {
    path: PathBuf,
    build_id: String,
    driver_version: String,
    open_requested: bool,
}

impl InstallCache {
    pub fn new(host_install_dir: &Path, build_id: &str, driver_version: &str) -> Self {
        Self {
            path: host_install_dir.join(CACHE_FILE),
            build_id: build_id.to_string(),
            driver_version: driver_version.to_string(),
            open_requested: false,
        }
    }

    /// Match and write records for a run that asks for open modules.
    pub fn with_open_requested(mut self, requested: bool) -> Self {
        self.open_requested = requested;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `(hit, open)`.
    ///
    /// A missing record is a miss. A record written for a different
    /// flavour request is a miss too. `open` reports whether the recorded
    /// install was the open module flavour.
    pub fn is_cached(&self) -> Result<(bool, bool)> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No cache record at {}", self.path.display());
                return Ok((false, false));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        let record = parse_env_file(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        let open = record.get(KERNEL_OPEN_KEY).is_some_and(|v| v == "Y");
        let requested = open || record.get(KERNEL_OPEN_REQUESTED_KEY).is_some_and(|v| v == "Y");
        let hit = record.get(BUILD_ID_KEY) == Some(&self.build_id)
            && record.get(DRIVER_VERSION_KEY) == Some(&self.driver_version)
            && requested == self.open_requested;
        Ok((hit, open))
    }

    /// Overwrite the record atomically.
    pub fn cache(&self, open: bool) -> Result<()> {
        let dir = self
            .path
            .parent()
            .with_context(|| format!("Cache path {} has no parent", self.path.display()))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;

        let mut contents = format!(
            "{}={}\n{}={}\n",
            BUILD_ID_KEY, self.build_id, DRIVER_VERSION_KEY, self.driver_version
        );
        if open {
            contents.push_str(&format!("{}=Y\n", KERNEL_OPEN_KEY));
        }
        if open || self.open_requested {
            contents.push_str(&format!("{}=Y\n", KERNEL_OPEN_REQUESTED_KEY));
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("Failed to rename {} to {}", tmp.display(), self.path.display())
        })?;

        debug!("Updated cache record {}", self.path.display());
        Ok(())
    }
}
