use anyhow::Result;
use clap::Args;
use gpu_driver_installer::download::GcsDownloader;
use gpu_driver_installer::host::HostEnv;
use gpu_driver_installer::list::list_drivers;
use gpu_driver_installer::process::SystemRunner;
use gpu_driver_installer::InstallPaths;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Read artifacts from the internal staging bucket
    #[arg(long)]
    pub internal_download: bool,

    /// Bucket to download build artifacts from
    #[arg(long)]
    pub gcs_download_bucket: Option<String>,

    /// Object prefix inside the download bucket
    #[arg(long)]
    pub gcs_download_prefix: Option<String>,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,
}

pub fn run(args: ListArgs) -> Result<()> {
    let paths = InstallPaths::default();
    let host = HostEnv::read(&paths.host_root)?;
    let runner = SystemRunner;
    let downloader = GcsDownloader::new(
        &runner,
        &host,
        args.gcs_download_bucket.as_deref(),
        args.gcs_download_prefix.as_deref(),
        args.internal_download,
    );
    print!("{}", list_drivers(&downloader)?);
    Ok(())
}
