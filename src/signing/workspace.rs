use super::append_signature;
use crate::archive::unpack_tar_gz;
use crate::download::{ArtifactDownloader, GPU_EXTENSION};
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PUBLIC_KEY_DER: &str = "gpu-driver-cert.der";
const DUMMY_KEY: &str = "dummy-key";

/// Directory holding downloaded signatures and the signing certificate.
#[derive(Debug, Clone)]
pub struct SigningWorkspace {
    dir: PathBuf,
}

impl SigningWorkspace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Detached signature for a module file name, e.g. `nvidia.ko`.
    pub fn module_signature(&self, module: &str) -> PathBuf {
        self.dir.join(format!("{}.sig", module))
    }

    pub fn public_key_der(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEY_DER)
    }

    /// Empty private key placeholder; the modules are already signed.
    pub fn private_key(&self) -> PathBuf {
        self.dir.join(DUMMY_KEY)
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create signing dir {}", self.dir.display()))
    }

    /// Signatures published in the gpu extension.
    pub fn download_driver_signatures(
        &self,
        downloader: &dyn ArtifactDownloader,
        version: &str,
    ) -> Result<()> {
        self.prepare()?;
        info!("Downloading driver signature for version {}", version);
        let tarball = downloader
            .download_extension_artifact(&self.dir, GPU_EXTENSION, &format!("{}.signature.tar.gz", version))
            .with_context(|| format!("Failed to download driver signature for version {}", version))?;
        self.decompress(&tarball)
    }

    /// Signatures published as a plain build artifact (test builds).
    pub fn download_build_signatures(
        &self,
        downloader: &dyn ArtifactDownloader,
        version: &str,
    ) -> Result<()> {
        self.prepare()?;
        info!("Downloading driver signature for version {} from build artifacts", version);
        let tarball = downloader
            .download_artifact(&self.dir, &format!("nvidia-drivers-{}-signature.tar.gz", version))
            .with_context(|| format!("Failed to download driver signature for version {}", version))?;
        self.decompress(&tarball)
    }

    pub fn download_signatures_from_url(
        &self,
        downloader: &dyn ArtifactDownloader,
        url: &str,
    ) -> Result<()> {
        self.prepare()?;
        info!("Downloading driver signature from URL: {}", url);
        let tarball = downloader
            .download_url(url, &self.dir)
            .with_context(|| format!("Failed to download driver signature from URL {}", url))?;
        self.decompress(&tarball)
    }

    fn decompress(&self, tarball: &Path) -> Result<()> {
        info!("Decompressing signature {}", tarball.display());
        unpack_tar_gz(tarball, &self.dir)
            .with_context(|| format!("Failed to extract driver signatures {}", tarball.display()))?;
        let key = self.private_key();
        fs::write(&key, b"")
            .with_context(|| format!("Failed to create dummy key file {}", key.display()))?;
        Ok(())
    }
}

/// Append the downloaded signature to each module, in place.
pub fn sign_modules(workspace: &SigningWorkspace, modules: &[PathBuf]) -> Result<()> {
    info!("Signing {} GPU driver modules", modules.len());
    for module in modules {
        let name = module
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", module.display()))?;
        let signature = workspace.module_signature(&name);
        if !signature.is_file() {
            bail!("No signature {} for module {}", signature.display(), name);
        }
        append_signature(module, module, &signature)
            .with_context(|| format!("Failed to sign kernel module {}", name))?;

        let bytes = fs::read(module).with_context(|| format!("Failed to read {}", module.display()))?;
        debug!("{}: sha256 {:x}", name, Sha256::digest(&bytes));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::MAGIC;
    use super::*;
    use crate::archive::testing::write_tar_gz;
    use crate::download::testing::FakeDownloader;
    use crate::errors::is_not_found;
    use tempfile::TempDir;

    fn signature_tarball(dir: &Path) -> Vec<u8> {
        let path = dir.join("sig.tar.gz");
        write_tar_gz(
            &path,
            &[
                ("nvidia.ko.sig", b"SIG-NVIDIA"),
                ("nvidia-uvm.ko.sig", b"SIG-UVM"),
                ("gpu-driver-cert.der", b"DER"),
            ],
        )
        .unwrap();
        fs::read(path).unwrap()
    }

    #[test]
    fn test_download_extension_signatures() -> Result<()> {
        let tmp = TempDir::new()?;
        let d = FakeDownloader::new().with_extension_artifact(
            "gpu",
            "535.104.12.signature.tar.gz",
            &signature_tarball(tmp.path()),
        );
        let ws = SigningWorkspace::new(tmp.path().join("sign"));
        ws.download_driver_signatures(&d, "535.104.12")?;

        assert_eq!(fs::read(ws.module_signature("nvidia.ko"))?, b"SIG-NVIDIA");
        assert_eq!(fs::read(ws.public_key_der())?, b"DER");
        assert!(ws.private_key().is_file());
        Ok(())
    }

    #[test]
    fn test_download_build_and_url_signatures() -> Result<()> {
        let tmp = TempDir::new()?;
        let tarball = signature_tarball(tmp.path());
        let url = "https://example.com/sigs/custom.tar.gz";
        let d = FakeDownloader::new()
            .with_artifact("nvidia-drivers-470.82.01-signature.tar.gz", &tarball)
            .with_url(url, &tarball);

        let ws = SigningWorkspace::new(tmp.path().join("a"));
        ws.download_build_signatures(&d, "470.82.01")?;
        assert!(ws.module_signature("nvidia-uvm.ko").is_file());

        let ws = SigningWorkspace::new(tmp.path().join("b"));
        ws.download_signatures_from_url(&d, url)?;
        assert!(ws.module_signature("nvidia-uvm.ko").is_file());
        Ok(())
    }

    #[test]
    fn test_missing_signature_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let ws = SigningWorkspace::new(tmp.path());
        let err = ws
            .download_driver_signatures(&FakeDownloader::new(), "1.2.3")
            .unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_sign_modules_in_place() -> Result<()> {
        let tmp = TempDir::new()?;
        let ws = SigningWorkspace::new(tmp.path().join("sign"));
        fs::create_dir_all(ws.dir())?;
        fs::write(ws.module_signature("nvidia.ko"), b"SIG")?;
        let drivers = tmp.path().join("drivers");
        fs::create_dir_all(&drivers)?;
        let module = drivers.join("nvidia.ko");
        fs::write(&module, b"ELF")?;

        sign_modules(&ws, &[module.clone()])?;
        let signed = fs::read(&module)?;
        assert!(signed.starts_with(b"ELFSIG"));
        assert!(signed.ends_with(MAGIC));
        Ok(())
    }

    #[test]
    fn test_sign_modules_requires_signature() {
        let tmp = TempDir::new().unwrap();
        let ws = SigningWorkspace::new(tmp.path().join("sign"));
        let module = tmp.path().join("nvidia-drm.ko");
        fs::write(&module, b"ELF").unwrap();
        let err = sign_modules(&ws, &[module]).unwrap_err();
        assert!(err.to_string().contains("No signature"));
    }
}
