//! Loading signing keys and GPU kernel modules.
//!
//! Loading is idempotent: a module already listed in `/proc/modules` is left
//! alone. The GPU modules always go in dependency order, whatever order the
//! caller lists them in, and any failure is reported as
//! [`InstallError::DriverLoad`](crate::errors::InstallError::DriverLoad).

use crate::errors::InstallError;
use crate::process::{Cmd, ProcessRunner};
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const KEYCTL: &str = "/bin/keyctl";

/// Name the signing certificate is registered under.
pub const GPU_KEY_NAME: &str = "gpu-key";

/// GPU modules in load order, with their object file names.
pub const GPU_MODULES: &[(&str, &str)] = &[
    ("nvidia", "nvidia.ko"),
    ("nvidia_uvm", "nvidia-uvm.ko"),
    ("nvidia_drm", "nvidia-drm.ko"),
    ("nvidia_modeset", "nvidia-modeset.ko"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyring {
    /// Keys trusted for module signature verification.
    SecondaryTrusted,
    /// Integrity measurement keyring.
    Ima,
}

impl Keyring {
    pub fn as_str(&self) -> &'static str {
        match self {
            Keyring::SecondaryTrusted => ".secondary_trusted_keys",
            Keyring::Ima => ".ima",
        }
    }
}

impl fmt::Display for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object file name for a module name, `nvidia_uvm` → `nvidia-uvm.ko`.
pub fn module_file_name(module: &str) -> String {
    GPU_MODULES
        .iter()
        .find(|(name, _)| *name == module)
        .map(|(_, file)| file.to_string())
        .unwrap_or_else(|| format!("{}.ko", module.replace('_', "-")))
}

fn load_rank(module: &str) -> usize {
    GPU_MODULES
        .iter()
        .position(|(name, _)| *name == module)
        .unwrap_or(GPU_MODULES.len())
}

pub struct ModuleLoader<'a> {
    runner: &'a dyn ProcessRunner,
    proc_modules: PathBuf,
}

impl<'a> ModuleLoader<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, proc_modules: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            proc_modules: proc_modules.into(),
        }
    }

    /// Add a DER certificate to `keyring`.
    pub fn load_public_key(&self, name: &str, der_path: &Path, keyring: Keyring) -> Result<()> {
        info!("Loading {} to {} keyring", name, keyring);
        let key = fs::read(der_path)
            .with_context(|| format!("Failed to read key {}", der_path.display()))?;
        Cmd::new(KEYCTL)
            .args(["padd", "asymmetric", name])
            .arg(format!("%keyring:{}", keyring))
            .stdin(key)
            .error_msg(format!("Failed to load {} to {} keyring", name, keyring))
            .run(self.runner)?;
        info!("Loaded key {} into {} keyring", name, keyring);
        Ok(())
    }

    pub fn is_loaded(&self, module: &str) -> Result<bool> {
        let table = fs::read_to_string(&self.proc_modules)
            .with_context(|| format!("Failed to read {}", self.proc_modules.display()))?;
        Ok(table
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|name| name == module))
    }

    /// Insert `path` unless `module` is already resident.
    pub fn load_module(&self, module: &str, path: &Path) -> Result<()> {
        if self.is_loaded(module)? {
            debug!("Module {} already loaded", module);
            return Ok(());
        }
        info!("Loading module {} from {}", module, path.display());
        Cmd::new("insmod")
            .arg_path(path)
            .error_msg(format!("Failed to run `insmod {}`", path.display()))
            .run(self.runner)?;
        Ok(())
    }

    /// Load the signing key (when modules are signed) and then `modules`
    /// from `drivers_dir` in dependency order.
    pub fn load_gpu_drivers(
        &self,
        drivers_dir: &Path,
        modules: &[&str],
        public_key: Option<&Path>,
    ) -> Result<()> {
        if let Some(der) = public_key {
            self.load_public_key(GPU_KEY_NAME, der, Keyring::SecondaryTrusted)
                .map_err(|e| InstallError::driver_load(GPU_KEY_NAME, e))?;
            if let Err(e) = self.load_public_key(GPU_KEY_NAME, der, Keyring::Ima) {
                warn!("Failed to load {} to the ima keyring: {:#}", GPU_KEY_NAME, e);
            }
        }

        let mut ordered = modules.to_vec();
        ordered.sort_by_key(|m| load_rank(m));
        for module in ordered {
            let path = drivers_dir.join(module_file_name(module));
            self.load_module(module, &path)
                .with_context(|| format!("Failed to load module {}", path.display()))
                .map_err(|e| InstallError::driver_load(module, e))?;
        }
        Ok(())
    }
}
