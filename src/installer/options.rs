use crate::errors::InstallError;

/// Validated knobs of one `install` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Requested driver: empty for the default, `latest`, an alias, or a
    /// concrete version.
    pub version: String,
    /// Install dir as seen from the host, e.g. `/home/kubernetes/bin/nvidia`.
    pub host_dir: String,
    pub allow_unsigned_driver: bool,
    /// Unofficial installer to use instead of the published one.
    pub nvidia_installer_url: Option<String>,
    /// Signature tarball matching `nvidia_installer_url`.
    pub signature_url: Option<String>,
    /// Test build: signatures come from build artifacts.
    pub test: bool,
    /// Stop after the toolchain and headers are in place.
    pub prepare_build_tools: bool,
    /// Prefer the open kernel module flavour when the GPU supports it.
    pub kernel_open: bool,
    /// Skip module loading and verification.
    pub no_verify: bool,
    pub debug: bool,
}

impl InstallOptions {
    pub fn need_signed(&self) -> bool {
        !self.allow_unsigned_driver
    }

    /// Reject flag combinations that cannot work, before anything is touched.
    pub fn validate(&self) -> Result<(), InstallError> {
        let has_installer_url = self.nvidia_installer_url.as_deref().is_some_and(|u| !u.is_empty());
        let has_signature_url = self.signature_url.as_deref().is_some_and(|u| !u.is_empty());

        if has_installer_url && !self.version.is_empty() {
            return Err(InstallError::Config(
                "--nvidia-installer-url and --version are mutually exclusive".into(),
            ));
        }
        if has_installer_url && !(self.test || self.allow_unsigned_driver) {
            return Err(InstallError::Config(
                "--nvidia-installer-url requires --test or --allow-unsigned-driver".into(),
            ));
        }
        if has_signature_url && !(self.test && has_installer_url) {
            return Err(InstallError::Config(
                "--signature-url requires --test and --nvidia-installer-url".into(),
            ));
        }
        if self.host_dir.trim_matches('/').is_empty() && !self.prepare_build_tools {
            return Err(InstallError::Config(
                "host install dir is not set; pass --host-dir or set NVIDIA_INSTALL_DIR_HOST".into(),
            ));
        }
        Ok(())
    }
}
