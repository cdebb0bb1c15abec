use super::{collect_into, kernel_objects, LinkContext};
use crate::process::Cmd;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LINKERS: &[&str] = &["ld", "ld.lld"];
const DISABLED_SUFFIX: &str = ".disabled";
const INSTALLER_LOG: &str = "nvidia-installer.log";

/// Keeps the toolchain's linkers renamed out of `PATH` while alive.
///
/// The vendor installer must link with the host's default tools; the
/// renames are undone on [`restore`](Self::restore) or drop.
pub struct RenamedLinker {
    renamed: Vec<(PathBuf, PathBuf)>,
}

impl RenamedLinker {
    pub fn new(bin_dir: &Path) -> Result<Self> {
        let mut guard = Self {
            renamed: Vec::new(),
        };
        for name in LINKERS {
            let original = bin_dir.join(name);
            if fs::symlink_metadata(&original).is_err() {
                continue;
            }
            let hidden = bin_dir.join(format!("{}{}", name, DISABLED_SUFFIX));
            fs::rename(&original, &hidden).with_context(|| {
                format!("Failed to rename {} to {}", original.display(), hidden.display())
            })?;
            guard.renamed.push((original, hidden));
        }
        Ok(guard)
    }

    /// Put every renamed linker back. Safe to call more than once.
    pub fn restore(&mut self) -> Result<()> {
        while let Some((original, hidden)) = self.renamed.pop() {
            fs::rename(&hidden, &original).with_context(|| {
                format!("Failed to restore {} from {}", original.display(), hidden.display())
            })?;
        }
        Ok(())
    }
}

impl Drop for RenamedLinker {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("{:#}", e);
        }
    }
}

/// The vendor installer invocation shared by the kernel and userspace passes.
pub fn installer_command(extract_dir: &Path, container_dir: &Path) -> Cmd {
    let prefix = container_dir.display();
    Cmd::new(extract_dir.join("nvidia-installer"))
        .arg(format!("--utility-prefix={}", prefix))
        .arg(format!("--opengl-prefix={}", prefix))
        .arg("--no-install-compat32-libs")
        .arg(format!(
            "--log-file-name={}",
            container_dir.join(INSTALLER_LOG).display()
        ))
        .arg("--silent")
        .arg("--accept-license")
        .current_dir(extract_dir)
}

/// Compile and link through the vendor installer.
///
/// When modules are to be signed afterwards the installer is expected to
/// fail at its own load step; the compiled objects are then taken from
/// `kernel/` in the extract dir.
pub fn link_drivers_legacy(ctx: &LinkContext<'_>) -> Result<Vec<PathBuf>> {
    info!("Building GPU drivers with the vendor installer");
    let mut linker = RenamedLinker::new(&ctx.env.toolchain_bin())?;

    let cmd = installer_command(ctx.extract_dir, ctx.container_dir).arg(format!(
        "--kernel-source-path={}",
        ctx.env.kernel_headers().display()
    ));
    let cmd = ctx.env.apply(cmd);
    info!("Installer arguments: {}", cmd);

    let modules = if ctx.need_signed {
        let result = cmd.allow_fail().run(ctx.runner)?;
        if !result.success() {
            info!("Installer exited with {:?}, expected for unsigned modules", result.code);
        }
        collect_into(&ctx.extract_dir.join("kernel"), &ctx.drivers_dir)?
    } else {
        cmd.error_msg("Failed to run GPU driver installer")
            .run(ctx.runner)?;
        kernel_objects(&ctx.drivers_dir)?
    };

    linker.restore()?;
    Ok(modules)
}
