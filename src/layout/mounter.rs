use anyhow::{Context, Result};
use nix::mount::{mount, umount, MsFlags};
use std::path::Path;
use tracing::debug;

/// Kernel mount operations used by the layout builder.
pub trait Mounter {
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Remount a bind mount read-write without `noexec`, `nosuid` or `nodev`.
    fn remount_exec(&self, target: &Path) -> Result<()>;

    /// Mount an overlay of `upper` on `lower` at `lower`.
    fn mount_overlay(&self, lower: &Path, upper: &Path, work: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Mounts through `mount(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        debug!("bind mount {} -> {}", source.display(), target.display());
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .with_context(|| format!("mount --bind {} {}", source.display(), target.display()))
    }

    fn remount_exec(&self, target: &Path) -> Result<()> {
        debug!("remount {}", target.display());
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RELATIME,
            None::<&str>,
        )
        .with_context(|| format!("mount -o remount {}", target.display()))
    }

    fn mount_overlay(&self, lower: &Path, upper: &Path, work: &Path) -> Result<()> {
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        debug!("overlay mount on {}: {}", lower.display(), data);
        mount(
            Some("none"),
            lower,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .with_context(|| format!("mount -t overlay {}", lower.display()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        umount(target).with_context(|| format!("umount {}", target.display()))
    }
}
