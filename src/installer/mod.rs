//! The install pipeline.
//!
//! ```text
//! detect gpu -> resolve version -> check cache --hit--> configure cached dirs -> load -> verify
//!                                      |
//!                                     miss
//!                                      v
//! acquire toolchain -> download artifacts -> configure layout -> extract installer
//!   -> link (modern | legacy) -> sign -> load -> install userspace -> verify -> write cache
//! ```
//!
//! When signing is required the modern strategy runs first. A failure to
//! load its modules, and only that, triggers a single retry of link, sign
//! and load with the legacy strategy. Unsigned installs go straight to the
//! legacy strategy. The mount layout is released on every exit path.

mod artifact;
mod driver;
mod options;

pub use artifact::{
    download_driver_installer, download_generic_installer, download_prebuilt_bundle,
    generic_installer_url, installer_download_location, precompiled_installer_url,
    prebuilt_bundle_name, version_from_installer_url,
};
pub use driver::{extract_installer, install_prebuilt_modules, install_public_key, install_userspace, verify};
pub use options::InstallOptions;

use crate::cache::InstallCache;
use crate::download::ArtifactDownloader;
use crate::errors::{is_driver_load, is_not_found, InstallError};
use crate::gpu::{self, version::resolve_driver_version, GpuModel};
use crate::host::{signature_enforcement_disabled, HostEnv};
use crate::layout::{LayoutBuilder, Mounter};
use crate::linker::{LinkContext, LinkStrategy};
use crate::modules::{ModuleLoader, GPU_MODULES};
use crate::paths::InstallPaths;
use crate::process::ProcessRunner;
use crate::signing::{is_signed, sign_modules, SigningWorkspace};
use crate::toolchain::{self, BuildEnv};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const NOT_AVAILABLE: &str = "The GPU driver is not available for this build yet. Please wait and retry.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DetectGpu,
    ResolveVersion,
    CheckCache,
    ConfigureCachedDirs,
    AcquireToolchain,
    DownloadArtifacts,
    ConfigureLayout,
    ExtractInstaller,
    InstallPrebuilt,
    Link(LinkStrategy),
    Sign,
    Load,
    InstallUserspace,
    Verify,
    UpdateHostLdCache,
    WriteCache,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::DetectGpu => f.write_str("detect gpu"),
            Stage::ResolveVersion => f.write_str("resolve driver version"),
            Stage::CheckCache => f.write_str("check cache"),
            Stage::ConfigureCachedDirs => f.write_str("configure cached dirs"),
            Stage::AcquireToolchain => f.write_str("acquire toolchain"),
            Stage::DownloadArtifacts => f.write_str("download artifacts"),
            Stage::ConfigureLayout => f.write_str("configure installation dirs"),
            Stage::ExtractInstaller => f.write_str("extract installer"),
            Stage::InstallPrebuilt => f.write_str("install prebuilt modules"),
            Stage::Link(strategy) => write!(f, "link ({})", strategy),
            Stage::Sign => f.write_str("sign modules"),
            Stage::Load => f.write_str("load modules"),
            Stage::InstallUserspace => f.write_str("install userspace"),
            Stage::Verify => f.write_str("verify"),
            Stage::UpdateHostLdCache => f.write_str("update host ld cache"),
            Stage::WriteCache => f.write_str("write cache"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// A matching install was found and re-activated.
    Cached { version: String },
    /// Fresh install. `strategy` is `None` when prebuilt modules were used.
    Installed {
        version: String,
        strategy: Option<LinkStrategy>,
        open: bool,
    },
    /// `--prepare-build-tools`: toolchain and headers are in place.
    BuildToolsPrepared,
}

struct Downloads {
    installer: PathBuf,
    bundle: Option<PathBuf>,
    signing: Option<SigningWorkspace>,
}

pub struct Installer<'a> {
    options: &'a InstallOptions,
    paths: &'a InstallPaths,
    host: &'a HostEnv,
    runner: &'a dyn ProcessRunner,
    mounter: &'a dyn Mounter,
    downloader: &'a dyn ArtifactDownloader,
}

impl<'a> Installer<'a> {
    pub fn new(
        options: &'a InstallOptions,
        paths: &'a InstallPaths,
        host: &'a HostEnv,
        runner: &'a dyn ProcessRunner,
        mounter: &'a dyn Mounter,
        downloader: &'a dyn ArtifactDownloader,
    ) -> Self {
        Self {
            options,
            paths,
            host,
            runner,
            mounter,
            downloader,
        }
    }

    fn stage<T>(&self, stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T> {
        debug!("==> {}", stage);
        f().with_context(|| format!("{} failed", stage))
    }

    pub fn run(&self) -> Result<InstallOutcome> {
        self.options.validate()?;
        if !self.host.is_supported_release_track() {
            return Err(InstallError::Config(format!(
                "GPU driver installation is not supported on the {} release track",
                self.host.release_track()
            ))
            .into());
        }

        let model = self.stage(Stage::DetectGpu, || gpu::detect(self.runner))?;
        if !model.is_present() {
            if self.options.prepare_build_tools || self.options.no_verify {
                warn!("No GPU device detected");
            } else {
                bail!("No GPU device found. Please have a GPU device configured");
            }
        }

        if self.options.prepare_build_tools {
            self.stage(Stage::AcquireToolchain, || {
                toolchain::acquire(self.downloader, self.runner, self.paths)
            })?;
            info!("Build tools are ready in {}", self.paths.toolchain_dir.display());
            return Ok(InstallOutcome::BuildToolsPrepared);
        }

        let version = self.stage(Stage::ResolveVersion, || self.resolve_version(model))?;
        info!("Using GPU driver version {}", version);
        if !self.options.need_signed() {
            if let Some(msg) = self.unsigned_module_warning() {
                warn!("{}", msg);
            }
        }

        let host_dir = self.paths.host_install_dir(&self.options.host_dir);
        let want_open = self.options.kernel_open && model.supports_open_kernel_modules();
        let cache =
            InstallCache::new(&host_dir, self.host.build_number(), &version).with_open_requested(want_open);
        if self.stage(Stage::CheckCache, || Ok(self.cache_hit(&cache)))? {
            return self.install_cached(&host_dir, version);
        }
        self.install_fresh(model, &host_dir, &cache, version, want_open)
    }

    fn resolve_version(&self, model: GpuModel) -> Result<String> {
        if let Some(url) = self.installer_url() {
            return version_from_installer_url(url)
                .with_context(|| format!("Cannot determine the driver version from {}", url));
        }
        resolve_driver_version(self.downloader, model, &self.options.version)
    }

    fn installer_url(&self) -> Option<&str> {
        self.options.nvidia_installer_url.as_deref().filter(|u| !u.is_empty())
    }

    fn signature_url(&self) -> Option<&str> {
        self.options.signature_url.as_deref().filter(|u| !u.is_empty())
    }

    /// Why unsigned modules may be rejected by this kernel, if they may.
    fn unsigned_module_warning(&self) -> Option<String> {
        match fs::read_to_string(&self.paths.kernel_cmdline) {
            Ok(cmdline) if signature_enforcement_disabled(&cmdline) => None,
            Ok(_) => Some(
                "Unsigned modules will be rejected unless the kernel command line has \
                 module.sig_enforce=0 and loadpin.enforce=0"
                    .to_string(),
            ),
            Err(e) => Some(format!(
                "Failed to read {}: {}",
                self.paths.kernel_cmdline.display(),
                e
            )),
        }
    }

    fn cache_hit(&self, cache: &InstallCache) -> bool {
        match cache.is_cached() {
            Ok((hit, open)) => {
                if hit {
                    debug!("Cache record matches, open modules: {}", open);
                }
                hit
            }
            Err(e) => {
                warn!("Ignoring unreadable cache record: {:#}", e);
                false
            }
        }
    }

    fn install_cached(&self, host_dir: &Path, version: String) -> Result<InstallOutcome> {
        info!("Found cached version {}, NOT building the drivers", version);
        let builder = LayoutBuilder::new(self.paths, self.mounter, self.runner);
        let mut layout = self.stage(Stage::ConfigureCachedDirs, || builder.configure_cached_dirs(host_dir))?;

        if !self.options.no_verify {
            self.stage(Stage::Load, || self.load_drivers())?;
            self.stage(Stage::Verify, || verify(self.runner, &self.paths.container_dir))?;
        }
        self.stage(Stage::UpdateHostLdCache, || builder.update_host_ld_cache(&self.options.host_dir))?;

        layout.release();
        Ok(InstallOutcome::Cached { version })
    }

    fn install_fresh(
        &self,
        model: GpuModel,
        host_dir: &Path,
        cache: &InstallCache,
        version: String,
        want_open: bool,
    ) -> Result<InstallOutcome> {
        let env = self.stage(Stage::AcquireToolchain, || {
            toolchain::acquire(self.downloader, self.runner, self.paths)
        })?;
        let downloads = self.stage(Stage::DownloadArtifacts, || {
            self.download_artifacts(model, &version, want_open)
        })?;

        let builder = LayoutBuilder::new(self.paths, self.mounter, self.runner);
        let mut layout = self.stage(Stage::ConfigureLayout, || {
            builder.configure_driver_installation_dirs(host_dir, self.host.kernel_release())
        })?;
        self.stage(Stage::ExtractInstaller, || {
            extract_installer(self.runner, &downloads.installer, &self.paths.extract_dir)
        })?;

        let signing = downloads.signing.as_ref();
        let (strategy, open) = match &downloads.bundle {
            Some(bundle) => {
                let modules = self.stage(Stage::InstallPrebuilt, || {
                    install_prebuilt_modules(
                        bundle,
                        &self.paths.download_dir.join("open-modules"),
                        &self.paths.drivers_dir(),
                    )
                })?;
                let mut unsigned = Vec::new();
                for module in modules {
                    if !is_signed(&module)? {
                        unsigned.push(module);
                    }
                }
                self.sign_and_load(&unsigned, signing)?;
                (None, true)
            }
            None => (Some(self.link_and_load(&env, signing)?), false),
        };

        // An unsigned legacy run already installed userspace with the modules.
        if strategy != Some(LinkStrategy::Legacy) || signing.is_some() {
            self.stage(Stage::InstallUserspace, || {
                install_userspace(self.runner, &self.paths.extract_dir, &self.paths.container_dir)
            })?;
        }
        if !self.options.no_verify {
            self.stage(Stage::Verify, || verify(self.runner, &self.paths.container_dir))?;
        }
        self.stage(Stage::UpdateHostLdCache, || builder.update_host_ld_cache(&self.options.host_dir))?;
        self.stage(Stage::WriteCache, || cache.cache(open))?;

        layout.release();
        info!("Finished installing GPU driver {}", version);
        Ok(InstallOutcome::Installed {
            version,
            strategy,
            open,
        })
    }

    fn download_artifacts(&self, model: GpuModel, version: &str, want_open: bool) -> Result<Downloads> {
        let dest = &self.paths.download_dir;

        let signing = if self.options.need_signed() {
            let workspace = SigningWorkspace::new(&self.paths.signing_dir);
            let fetched = match self.signature_url() {
                Some(url) => workspace.download_signatures_from_url(self.downloader, url),
                None if self.options.test => workspace.download_build_signatures(self.downloader, version),
                None => workspace.download_driver_signatures(self.downloader, version),
            };
            fetched.map_err(|e| if is_not_found(&e) { e.context(NOT_AVAILABLE) } else { e })?;
            Some(workspace)
        } else {
            None
        };

        if self.options.kernel_open && !want_open {
            info!("{} GPUs cannot run open kernel modules, using the proprietary flavour", model);
        }
        let bundle = match self.installer_url() {
            None if want_open => download_prebuilt_bundle(self.downloader, version, dest)?,
            _ => None,
        };

        let installer = match self.installer_url() {
            Some(url) => self
                .downloader
                .download_url(url, dest)
                .with_context(|| format!("Failed to download GPU driver installer from {}", url))?,
            None if bundle.is_some() => download_generic_installer(self.downloader, version, dest)?,
            None => download_driver_installer(self.downloader, self.host, version, dest)
                .map_err(|e| if is_not_found(&e) { e.context(NOT_AVAILABLE) } else { e })?,
        };

        Ok(Downloads {
            installer,
            bundle,
            signing,
        })
    }

    /// Link with the preferred strategy, falling back to legacy once when
    /// the linked modules fail to load.
    fn link_and_load(&self, env: &BuildEnv, signing: Option<&SigningWorkspace>) -> Result<LinkStrategy> {
        let first = if signing.is_some() {
            LinkStrategy::Modern
        } else {
            LinkStrategy::Legacy
        };
        match self.link_sign_load(first, env, signing) {
            Ok(()) => Ok(first),
            Err(e) if first == LinkStrategy::Modern && is_driver_load(&e) => {
                warn!(
                    "Modules from the {} link failed to load, retrying with the {} link: {:#}",
                    first,
                    LinkStrategy::Legacy,
                    e
                );
                self.link_sign_load(LinkStrategy::Legacy, env, signing)?;
                Ok(LinkStrategy::Legacy)
            }
            Err(e) => Err(e),
        }
    }

    fn link_sign_load(
        &self,
        strategy: LinkStrategy,
        env: &BuildEnv,
        signing: Option<&SigningWorkspace>,
    ) -> Result<()> {
        let ctx = LinkContext {
            runner: self.runner,
            env,
            extract_dir: &self.paths.extract_dir,
            container_dir: &self.paths.container_dir,
            drivers_dir: self.paths.drivers_dir(),
            need_signed: signing.is_some(),
        };
        let modules = self.stage(Stage::Link(strategy), || strategy.link(&ctx))?;
        self.sign_and_load(&modules, signing)
    }

    fn sign_and_load(&self, modules: &[PathBuf], signing: Option<&SigningWorkspace>) -> Result<()> {
        if let Some(workspace) = signing {
            self.stage(Stage::Sign, || {
                sign_modules(workspace, modules)?;
                install_public_key(&workspace.public_key_der(), &self.paths.public_key_der())
            })?;
        }
        if !self.options.no_verify {
            self.stage(Stage::Load, || self.load_drivers())?;
        }
        Ok(())
    }

    fn load_drivers(&self) -> Result<()> {
        let key = self.options.need_signed().then(|| self.paths.public_key_der());
        let names: Vec<&str> = GPU_MODULES.iter().map(|(name, _)| *name).collect();
        ModuleLoader::new(self.runner, &self.paths.proc_modules).load_gpu_drivers(
            &self.paths.drivers_dir(),
            &names,
            key.as_deref(),
        )
    }
}
