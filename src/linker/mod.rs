//! Turning the vendor's precompiled objects into loadable kernel modules.
//!
//! Two strategies exist:
//!
//! - [`LinkStrategy::Modern`] relocates the vendor's prebuilt interface
//!   objects against the kernel's module linker script with `ld.lld -r`.
//!   Fast, no compiler involved.
//! - [`LinkStrategy::Legacy`] runs the vendor installer, which compiles the
//!   interface layer against the kernel headers and links it itself.
//!
//! Which one runs, and the retry between them, is decided by the installer.

mod legacy;
mod modern;

pub use legacy::{installer_command, link_drivers_legacy, RenamedLinker};
pub use modern::{link_drivers, module_linker_script};

use crate::process::ProcessRunner;
use crate::toolchain::BuildEnv;
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Inputs shared by both strategies.
pub struct LinkContext<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub env: &'a BuildEnv,
    /// Where the vendor installer was extracted.
    pub extract_dir: &'a Path,
    /// In-environment install mount point.
    pub container_dir: &'a Path,
    /// Final location of the kernel objects.
    pub drivers_dir: PathBuf,
    /// Modules will be signed after linking.
    pub need_signed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStrategy {
    Modern,
    Legacy,
}

impl LinkStrategy {
    /// Produce the kernel objects in the drivers dir and return their paths.
    pub fn link(self, ctx: &LinkContext<'_>) -> Result<Vec<PathBuf>> {
        match self {
            LinkStrategy::Modern => link_drivers(ctx),
            LinkStrategy::Legacy => link_drivers_legacy(ctx),
        }
    }
}

impl fmt::Display for LinkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStrategy::Modern => f.write_str("modern"),
            LinkStrategy::Legacy => f.write_str("legacy"),
        }
    }
}

/// `.ko` files directly inside `dir`, sorted by name.
pub fn kernel_objects(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut objects = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|e| e == "ko") {
            objects.push(path.to_path_buf());
        }
    }
    objects.sort();
    Ok(objects)
}

/// Move `src` into `dest_dir`, copying when they are on different filesystems.
pub fn move_into(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    let dest = dest_dir.join(name);
    if fs::rename(src, &dest).is_err() {
        fs::copy(src, &dest)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
        fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
    }
    debug!("Moved {} to {}", src.display(), dest.display());
    Ok(dest)
}

/// Move every `.ko` in `staging` into `drivers_dir`.
pub(crate) fn collect_into(staging: &Path, drivers_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(drivers_dir)
        .with_context(|| format!("Failed to create dir {}", drivers_dir.display()))?;
    kernel_objects(staging)?
        .iter()
        .map(|ko| move_into(ko, drivers_dir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kernel_objects_is_shallow_and_sorted() -> Result<()> {
        let tmp = TempDir::new()?;
        fs::write(tmp.path().join("nvidia-uvm.ko"), b"u")?;
        fs::write(tmp.path().join("nvidia.ko"), b"n")?;
        fs::write(tmp.path().join("nv-linux.o"), b"o")?;
        fs::create_dir(tmp.path().join("nested"))?;
        fs::write(tmp.path().join("nested/inner.ko"), b"i")?;

        let names: Vec<_> = kernel_objects(tmp.path())?
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["nvidia-uvm.ko", "nvidia.ko"]);
        Ok(())
    }

    #[test]
    fn test_collect_into_moves_objects() -> Result<()> {
        let tmp = TempDir::new()?;
        let staging = tmp.path().join("staging");
        fs::create_dir(&staging)?;
        fs::write(staging.join("nvidia.ko"), b"n")?;

        let drivers = tmp.path().join("drivers");
        let moved = collect_into(&staging, &drivers)?;
        assert_eq!(moved, vec![drivers.join("nvidia.ko")]);
        assert!(!staging.join("nvidia.ko").exists());
        assert_eq!(fs::read(drivers.join("nvidia.ko"))?, b"n");
        Ok(())
    }
}
