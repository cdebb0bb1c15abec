//! Fixed host and in-environment locations.
//!
//! Every path the pipeline touches lives here so that tests can relocate the
//! whole tree under a temporary directory with [`InstallPaths::rooted_at`].

use std::path::{Path, PathBuf};

/// Where the host root filesystem is mounted inside the installer environment.
pub const HOST_ROOT: &str = "/root";

/// In-environment mount point that is bind-mounted onto the host install dir.
pub const GPU_INSTALL_DIR_CONTAINER: &str = "/usr/local/nvidia";

/// Env var consulted for the host install dir when the flag is unset.
pub const HOST_DIR_ENV: &str = "NVIDIA_INSTALL_DIR_HOST";

/// All fixed paths used by one installer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    /// Host root filesystem (`/root`).
    pub host_root: PathBuf,
    /// Mount point the host install dir is bound to (`/usr/local/nvidia`).
    pub container_dir: PathBuf,
    /// System binary dir overlaid with `<container>/bin`.
    pub usr_bin: PathBuf,
    /// System library dir overlaid with `<container>/lib64`.
    pub usr_lib: PathBuf,
    /// Kernel module tree; `<release>/video` is overlaid with `<container>/drivers`.
    pub modules_root: PathBuf,
    /// Dynamic linker config snippet for the container.
    pub ld_conf: PathBuf,
    /// Where downloaded installers and bundles are staged before mounting.
    pub download_dir: PathBuf,
    /// Fixed extraction target so rebuilt modules are byte-identical.
    pub extract_dir: PathBuf,
    /// Cross toolchain and kernel headers.
    pub toolchain_dir: PathBuf,
    /// Downloaded detached signatures and certificates.
    pub signing_dir: PathBuf,
    /// Scratch dir for the CC wrapper and toolchain env file.
    pub work_dir: PathBuf,
    /// Kernel's loaded-module table.
    pub proc_modules: PathBuf,
    /// Kernel command line.
    pub kernel_cmdline: PathBuf,
    /// Process-wide lock file.
    pub lock_file: PathBuf,
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self {
            host_root: PathBuf::from(HOST_ROOT),
            container_dir: PathBuf::from(GPU_INSTALL_DIR_CONTAINER),
            usr_bin: PathBuf::from("/usr/bin"),
            usr_lib: PathBuf::from("/usr/lib/x86_64-linux-gnu"),
            modules_root: PathBuf::from("/lib/modules"),
            ld_conf: PathBuf::from("/etc/ld.so.conf.d/nvidia.conf"),
            download_dir: PathBuf::from("/tmp/nvidia-downloads"),
            extract_dir: PathBuf::from("/tmp/extract"),
            toolchain_dir: PathBuf::from("/build/cos-tools"),
            signing_dir: PathBuf::from("/build/sign-gpu-driver"),
            work_dir: PathBuf::from("/tmp/gpu-driver-installer"),
            proc_modules: PathBuf::from("/proc/modules"),
            kernel_cmdline: PathBuf::from("/proc/cmdline"),
            lock_file: PathBuf::from("/root/tmp/gpu_driver_installer.lock"),
        }
    }
}

impl InstallPaths {
    /// Same layout with every absolute path re-rooted under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let base = Self::default();
        let rebase = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            host_root: rebase(&base.host_root),
            container_dir: rebase(&base.container_dir),
            usr_bin: rebase(&base.usr_bin),
            usr_lib: rebase(&base.usr_lib),
            modules_root: rebase(&base.modules_root),
            ld_conf: rebase(&base.ld_conf),
            download_dir: rebase(&base.download_dir),
            extract_dir: rebase(&base.extract_dir),
            toolchain_dir: rebase(&base.toolchain_dir),
            signing_dir: rebase(&base.signing_dir),
            work_dir: rebase(&base.work_dir),
            proc_modules: rebase(&base.proc_modules),
            kernel_cmdline: rebase(&base.kernel_cmdline),
            lock_file: rebase(&base.lock_file),
        }
    }

    /// Host install dir for a user-supplied (host-relative) path.
    pub fn host_install_dir(&self, relative: &str) -> PathBuf {
        self.host_root.join(relative.trim_start_matches('/'))
    }

    /// Final kernel object directory inside the container mount.
    pub fn drivers_dir(&self) -> PathBuf {
        self.container_dir.join("drivers")
    }

    /// Kernel module dir that receives the drivers overlay.
    pub fn video_modules_dir(&self, kernel_release: &str) -> PathBuf {
        self.modules_root.join(kernel_release).join("video")
    }

    pub fn public_key_der(&self) -> PathBuf {
        self.container_dir.join("pubkey.der")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_at_rebases_every_path() {
        let paths = InstallPaths::rooted_at(Path::new("/tmp/t"));
        assert_eq!(paths.container_dir, PathBuf::from("/tmp/t/usr/local/nvidia"));
        assert_eq!(paths.proc_modules, PathBuf::from("/tmp/t/proc/modules"));
        assert_eq!(
            paths.lock_file,
            PathBuf::from("/tmp/t/root/tmp/gpu_driver_installer.lock")
        );
    }

    #[test]
    fn test_host_install_dir_is_joined_under_host_root() {
        let paths = InstallPaths::default();
        assert_eq!(
            paths.host_install_dir("/home/kubernetes/bin/nvidia"),
            PathBuf::from("/root/home/kubernetes/bin/nvidia")
        );
        assert_eq!(paths.host_install_dir(""), PathBuf::from("/root"));
    }

    #[test]
    fn test_video_modules_dir() {
        let paths = InstallPaths::default();
        assert_eq!(
            paths.video_modules_dir("6.1.58+"),
            PathBuf::from("/lib/modules/6.1.58+/video")
        );
    }
}
