//! Gzip-compressed tarball extraction.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::Path;
use tar::Archive;

/// Unpack a `.tar.gz`/`.tgz` archive into `dest`, creating it if needed.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory {}", dest.display()))?;

    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut tarball = Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(true);
    tarball
        .unpack(dest)
        .with_context(|| format!("Failed to extract {} to {}", archive.display(), dest.display()))?;

    Ok(())
}
