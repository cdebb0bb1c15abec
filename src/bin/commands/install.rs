use anyhow::Result;
use clap::Args;
use gpu_driver_installer::download::GcsDownloader;
use gpu_driver_installer::host::HostEnv;
use gpu_driver_installer::layout::SysMounter;
use gpu_driver_installer::lock::InstallerLock;
use gpu_driver_installer::preflight;
use gpu_driver_installer::process::SystemRunner;
use gpu_driver_installer::{InstallOptions, InstallOutcome, InstallPaths, Installer};
use tracing::info;

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Driver version: empty for the default, `latest`, an alias such as R470, or a concrete version
    #[arg(long, default_value = "")]
    pub version: String,

    /// Install dir on the host
    #[arg(long, env = "NVIDIA_INSTALL_DIR_HOST", default_value = "")]
    pub host_dir: String,

    /// Install a driver without signing it
    #[arg(long)]
    pub allow_unsigned_driver: bool,

    /// Bucket to download build artifacts from
    #[arg(long)]
    pub gcs_download_bucket: Option<String>,

    /// Object prefix inside the download bucket
    #[arg(long)]
    pub gcs_download_prefix: Option<String>,

    /// Unofficial driver installer to use
    #[arg(long)]
    pub nvidia_installer_url: Option<String>,

    /// Signature tarball for --nvidia-installer-url
    #[arg(long)]
    pub signature_url: Option<String>,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Read signatures from test build artifacts
    #[arg(long)]
    pub test: bool,

    /// Only download the toolchain and kernel headers
    #[arg(long)]
    pub prepare_build_tools: bool,

    /// Install the open kernel modules when the GPU supports them
    #[arg(long)]
    pub kernel_open: bool,

    /// Skip loading and verifying the driver
    #[arg(long)]
    pub no_verify: bool,
}

impl InstallArgs {
    fn options(&self) -> InstallOptions {
        InstallOptions {
            version: self.version.clone(),
            host_dir: self.host_dir.clone(),
            allow_unsigned_driver: self.allow_unsigned_driver,
            nvidia_installer_url: self.nvidia_installer_url.clone(),
            signature_url: self.signature_url.clone(),
            test: self.test,
            prepare_build_tools: self.prepare_build_tools,
            kernel_open: self.kernel_open,
            no_verify: self.no_verify,
            debug: self.debug,
        }
    }
}

pub fn run(args: InstallArgs) -> Result<()> {
    let options = args.options();
    options.validate()?;

    let paths = InstallPaths::default();
    let _lock = InstallerLock::acquire(&paths.lock_file)?;
    preflight::check_host_tools()?;

    let host = HostEnv::read(&paths.host_root)?;
    info!(
        "Host build {} (milestone {}, kernel {})",
        host.build_number(),
        host.milestone(),
        host.kernel_release()
    );

    let runner = SystemRunner;
    let downloader = GcsDownloader::new(
        &runner,
        &host,
        args.gcs_download_bucket.as_deref(),
        args.gcs_download_prefix.as_deref(),
        false,
    );
    let outcome = Installer::new(&options, &paths, &host, &runner, &SysMounter, &downloader).run()?;

    match outcome {
        InstallOutcome::Cached { version } => info!("GPU driver {} re-activated from cache", version),
        InstallOutcome::Installed {
            version,
            strategy,
            open,
        } => {
            let how = match strategy {
                Some(s) => format!("{} link", s),
                None => "prebuilt modules".to_string(),
            };
            info!(
                "GPU driver {} installed ({}{})",
                version,
                how,
                if open { ", open kernel modules" } else { "" }
            );
        }
        InstallOutcome::BuildToolsPrepared => info!("Build tools prepared"),
    }
    Ok(())
}
