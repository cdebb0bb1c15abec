//! Installation directory layout.
//!
//! The host root filesystem is read-only for binaries, libraries and kernel
//! modules. The layout redirects writes into a host-persisted directory:
//!
//! ```text
//! <host install dir>          --bind-->    /usr/local/nvidia
//! /usr/local/nvidia/bin       --overlay--> /usr/bin
//! /usr/local/nvidia/lib64     --overlay--> /usr/lib/x86_64-linux-gnu
//! /usr/local/nvidia/drivers   --overlay--> /lib/modules/<release>/video
//! ```
//!
//! The mounts are owned by an [`InstallationLayout`] handle that unmounts
//! them in reverse order exactly once, on [`release`](InstallationLayout::release)
//! or on drop.

mod mounter;

pub use mounter::{Mounter, SysMounter};

use crate::paths::InstallPaths;
use crate::process::{Cmd, ProcessRunner};
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create dir {}", dir.display()))
}

/// Mounts held for the duration of an install.
pub struct InstallationLayout<'a> {
    mounter: &'a dyn Mounter,
    /// In acquisition order.
    mounts: Vec<PathBuf>,
    released: bool,
}

impl<'a> InstallationLayout<'a> {
    fn new(mounter: &'a dyn Mounter, mounts: Vec<PathBuf>) -> Self {
        Self {
            mounter,
            mounts,
            released: false,
        }
    }

    pub fn mount_points(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// Unmount everything in reverse acquisition order. Later calls are no-ops.
    ///
    /// Unmount failures are logged and do not stop the remaining unmounts.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for target in self.mounts.iter().rev() {
            match self.mounter.unmount(target) {
                Ok(()) => debug!("Unmounted {}", target.display()),
                Err(e) => warn!("Failed to unmount {}: {:#}", target.display(), e),
            }
        }
    }
}

impl Drop for InstallationLayout<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Creates the mounts and linker config that make up the install layout.
pub struct LayoutBuilder<'a> {
    paths: &'a InstallPaths,
    mounter: &'a dyn Mounter,
    runner: &'a dyn ProcessRunner,
}

impl<'a> LayoutBuilder<'a> {
    pub fn new(paths: &'a InstallPaths, mounter: &'a dyn Mounter, runner: &'a dyn ProcessRunner) -> Self {
        Self {
            paths,
            mounter,
            runner,
        }
    }

    /// Bind-mount `host_dir` onto `container_dir` and remount it executable.
    pub fn create_host_dir_bind_mount(&self, host_dir: &Path, container_dir: &Path) -> Result<()> {
        create_dir(host_dir)?;
        create_dir(container_dir)?;
        self.mounter
            .bind_mount(host_dir, container_dir)
            .with_context(|| format!("Failed to create bind mount {}", container_dir.display()))?;
        self.mounter
            .remount_exec(container_dir)
            .with_context(|| format!("Failed to remount {}", container_dir.display()))?;
        Ok(())
    }

    /// Overlay `upper` onto `lower`, using `lower` as the merged mount point.
    pub fn create_overlay_fs(&self, lower: &Path, upper: &Path, work: &Path) -> Result<()> {
        create_dir(lower)?;
        create_dir(upper)?;
        create_dir(work)?;
        self.mounter.mount_overlay(lower, upper, work).with_context(|| {
            format!(
                "Failed to create overlayfs (lowerdir={}, upperdir={})",
                lower.display(),
                upper.display()
            )
        })
    }

    /// Point the in-container dynamic linker at the installed libraries.
    pub fn update_container_ld_cache(&self) -> Result<()> {
        info!("Updating container's ld cache");
        let conf = &self.paths.ld_conf;
        if let Some(parent) = conf.parent() {
            create_dir(parent)?;
        }
        let lib_dir = self.paths.container_dir.join("lib64");
        fs::write(conf, format!("{}\n", lib_dir.display()))
            .with_context(|| format!("Failed to write {}", conf.display()))?;
        Cmd::new("ldconfig")
            .error_msg("Failed to update ld cache")
            .run(self.runner)?;
        Ok(())
    }

    /// Full layout for a fresh install.
    pub fn configure_driver_installation_dirs(
        &self,
        host_dir: &Path,
        kernel_release: &str,
    ) -> Result<InstallationLayout<'a>> {
        info!("Configuring driver installation directories");
        let container = &self.paths.container_dir;
        let mut mounts = Vec::new();

        self.create_host_dir_bind_mount(host_dir, container)
            .context("Failed to create driver installation dir")?;
        mounts.push(container.clone());

        let overlays = [
            ("bin", self.paths.usr_bin.clone()),
            ("lib64", self.paths.usr_lib.clone()),
            ("drivers", self.paths.video_modules_dir(kernel_release)),
        ];
        for (name, lower) in overlays {
            let upper = container.join(name);
            let work = container.join(format!("{}-workdir", name));
            self.create_overlay_fs(&lower, &upper, &work)
                .with_context(|| format!("Failed to create {} overlay", name))?;
            mounts.push(lower);
        }

        self.update_container_ld_cache()?;
        Ok(InstallationLayout::new(self.mounter, mounts))
    }

    /// Layout for a cached install: the bind mount and linker cache only.
    pub fn configure_cached_dirs(&self, host_dir: &Path) -> Result<InstallationLayout<'a>> {
        info!("Configuring cached driver installation");
        let container = &self.paths.container_dir;
        self.create_host_dir_bind_mount(host_dir, container)
            .context("Failed to create driver installation dir")?;
        self.update_container_ld_cache()?;
        Ok(InstallationLayout::new(self.mounter, vec![container.clone()]))
    }

    /// Make the installed libraries visible to the host's dynamic linker.
    ///
    /// `host_relative_dir` is the install dir as seen from the host.
    pub fn update_host_ld_cache(&self, host_relative_dir: &str) -> Result<()> {
        info!("Updating host's ld cache");
        let host_root = &self.paths.host_root;
        let conf = host_root.join("etc/ld.so.conf");
        let lib_dir = Path::new("/").join(host_relative_dir.trim_start_matches('/')).join("lib64");
        let entry = lib_dir.display().to_string();

        let existing = fs::read_to_string(&conf)
            .with_context(|| format!("Failed to read {}", conf.display()))?;
        if existing.lines().any(|l| l.trim() == entry) {
            debug!("{} already lists {}", conf.display(), entry);
        } else {
            let mut file = OpenOptions::new()
                .append(true)
                .open(&conf)
                .with_context(|| format!("Failed to open {}", conf.display()))?;
            let sep = if existing.is_empty() || existing.ends_with('\n') { "" } else { "\n" };
            writeln!(file, "{}{}", sep, entry)
                .with_context(|| format!("Failed to write {:?} to {}", entry, conf.display()))?;
        }

        Cmd::new("ldconfig")
            .arg("-r")
            .arg_path(host_root)
            .error_msg(format!("Failed to run `ldconfig -r {}`", host_root.display()))
            .run(self.runner)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mounter that records calls instead of touching the kernel.

    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingMounter {
        ops: Mutex<Vec<String>>,
        fail_target: Option<PathBuf>,
    }

    impl RecordingMounter {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Fail any mount whose target is `target`.
        pub(crate) fn failing_on(target: &Path) -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                fail_target: Some(target.to_path_buf()),
            }
        }

        pub(crate) fn ops(&self) -> Vec<String> {
            self.ops.lock().map(|o| o.clone()).unwrap_or_default()
        }

        pub(crate) fn unmounts(&self) -> Vec<String> {
            self.ops()
                .into_iter()
                .filter_map(|op| op.strip_prefix("umount ").map(str::to_string))
                .collect()
        }

        fn record(&self, op: String, target: &Path) -> Result<()> {
            if self.fail_target.as_deref() == Some(target) {
                bail!("mount {} refused", target.display());
            }
            if let Ok(mut ops) = self.ops.lock() {
                ops.push(op);
            }
            Ok(())
        }
    }

    impl Mounter for RecordingMounter {
        fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
            self.record(format!("bind {} {}", source.display(), target.display()), target)
        }

        fn remount_exec(&self, target: &Path) -> Result<()> {
            self.record(format!("remount {}", target.display()), target)
        }

        fn mount_overlay(&self, lower: &Path, _upper: &Path, _work: &Path) -> Result<()> {
            self.record(format!("overlay {}", lower.display()), lower)
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            if let Ok(mut ops) = self.ops.lock() {
                ops.push(format!("umount {}", target.display()));
            }
            Ok(())
        }
    }
}
