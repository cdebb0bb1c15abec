use super::{collect_into, LinkContext};
use crate::process::Cmd;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Prebuilt objects combined into each module, relative to the extract dir.
const LINK_UNITS: &[(&str, &[&str])] = &[
    (
        "nvidia.ko",
        &[
            "kernel/precompiled/nv-linux.o",
            "kernel/nvidia/nv-kernel.o_binary",
        ],
    ),
    (
        "nvidia-modeset.ko",
        &[
            "kernel/precompiled/nv-modeset-linux.o",
            "kernel/nvidia-modeset/nv-modeset-kernel.o_binary",
        ],
    ),
];

/// The kernel's module linker script, newer headers first.
pub fn module_linker_script(kernel_headers: &Path) -> Option<PathBuf> {
    ["scripts/module.lds", "scripts/module-common.lds"]
        .iter()
        .map(|rel| kernel_headers.join(rel))
        .find(|p| p.is_file())
}

/// Relocatable-link the prebuilt objects and move every module in the
/// precompiled staging dir into the drivers dir.
pub fn link_drivers(ctx: &LinkContext<'_>) -> Result<Vec<PathBuf>> {
    info!("Linking GPU drivers");
    let ld = ctx.env.toolchain_bin().join("ld.lld");
    if !ld.is_file() {
        bail!("Linker {} not found", ld.display());
    }
    let Some(script) = module_linker_script(ctx.env.kernel_headers()) else {
        bail!(
            "No module linker script under {}",
            ctx.env.kernel_headers().join("scripts").display()
        );
    };

    let staging = ctx.extract_dir.join("kernel/precompiled");
    for (module, inputs) in LINK_UNITS {
        let out = staging.join(module);
        let cmd = Cmd::new(&ld)
            .arg("-T")
            .arg_path(&script)
            .arg("-r")
            .arg("-o")
            .arg_path(&out)
            .args(inputs.iter().map(|i| ctx.extract_dir.join(i)))
            .error_msg(format!("Failed to link {}", module));
        ctx.env.apply(cmd).run(ctx.runner)?;
    }

    let modules = collect_into(&staging, &ctx.drivers_dir)?;
    info!("Linked {} kernel modules", modules.len());
    Ok(modules)
}
