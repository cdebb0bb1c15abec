//! Cross toolchain and kernel headers.
//!
//! The host ships no compiler. The toolchain tarball and kernel headers for
//! the running build are downloaded into the toolchain dir (skipped when a
//! previous run left them there), and the compilation environment is
//! collected into a [`BuildEnv`] that is handed to every child process that
//! compiles or links. The installer's own environment is never modified.

use crate::archive::unpack_tar_gz;
use crate::download::ArtifactDownloader;
use crate::host::load_env_file;
use crate::paths::InstallPaths;
use crate::process::{Cmd, ProcessRunner};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_CC: &str = "x86_64-cros-linux-gnu-gcc";
const DEFAULT_CXX: &str = "x86_64-cros-linux-gnu-g++";
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const HEADERS_PREFIX: &str = "linux-headers";

/// Environment for compiling and linking kernel objects.
#[derive(Debug, Clone, Default)]
pub struct BuildEnv {
    vars: BTreeMap<String, String>,
    toolchain_dir: PathBuf,
    kernel_headers: PathBuf,
}

impl BuildEnv {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Attach this environment to `cmd`.
    pub fn apply(&self, cmd: Cmd) -> Cmd {
        cmd.envs(self.vars())
    }

    pub fn toolchain_dir(&self) -> &Path {
        &self.toolchain_dir
    }

    pub fn toolchain_bin(&self) -> PathBuf {
        self.toolchain_dir.join("bin")
    }

    pub fn kernel_headers(&self) -> &Path {
        &self.kernel_headers
    }

    pub fn cc(&self) -> &str {
        self.get("CC").unwrap_or(DEFAULT_CC)
    }

    fn prepend_path(&mut self, dir: &Path) {
        let current = self.get("PATH").unwrap_or(DEFAULT_PATH).to_string();
        self.set("PATH", format!("{}:{}", dir.display(), current));
    }
}

/// Compiler variables from the build's `toolchain_env` artifact, or the
/// cross-gcc defaults when the build does not publish one.
pub fn set_compilation_env(downloader: &dyn ArtifactDownloader, work_dir: &Path) -> Result<BuildEnv> {
    debug!("Downloading compilation environment variables");
    let mut env = BuildEnv::default();
    match downloader.download_toolchain_env(work_dir) {
        Ok(path) => {
            for (key, value) in load_env_file(&path).context("Failed to parse toolchain_env file")? {
                env.set(key, value);
            }
        }
        Err(e) => {
            debug!("Using default compilation environment variables ({:#})", e);
            env.set("CC", DEFAULT_CC);
            env.set("CXX", DEFAULT_CXX);
        }
    }
    for (key, value) in env.vars() {
        debug!("{}={}", key, value);
    }
    Ok(env)
}

/// Headers directory unpacked from the kernel headers tarball, if any.
pub fn kernel_headers_dir(toolchain_dir: &Path) -> Option<PathBuf> {
    let src = toolchain_dir.join("usr/src");
    let mut dirs: Vec<PathBuf> = fs::read_dir(&src)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(HEADERS_PREFIX))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

/// Download and unpack the toolchain and kernel headers into `toolchain_dir`
/// unless they are already there.
pub fn install_cross_toolchain(
    downloader: &dyn ArtifactDownloader,
    runner: &dyn ProcessRunner,
    toolchain_dir: &Path,
) -> Result<PathBuf> {
    info!("Installing the toolchain");
    fs::create_dir_all(toolchain_dir)
        .with_context(|| format!("Failed to create dir {}", toolchain_dir.display()))?;

    if toolchain_dir.join("bin").is_dir() {
        info!("Found existing toolchain. Skipping download and installation.");
    } else {
        let archive = downloader
            .download_toolchain(toolchain_dir)
            .context("Failed to download toolchain")?;
        info!("Unpacking toolchain...");
        Cmd::new("tar")
            .arg("xf")
            .arg_path(&archive)
            .arg("-C")
            .arg_path(toolchain_dir)
            .error_msg("Failed to extract toolchain archive tarball")
            .run(runner)?;
        let _ = fs::remove_file(&archive);
        info!("Done unpacking toolchain");
    }

    if let Some(headers) = kernel_headers_dir(toolchain_dir) {
        info!("Found existing kernel headers. Skipping download and installation.");
        return Ok(headers);
    }

    let archive = downloader
        .download_kernel_headers(toolchain_dir)
        .context("Failed to download kernel headers")?;
    info!("Unpacking kernel headers...");
    unpack_tar_gz(&archive, toolchain_dir).context("Failed to extract kernel headers")?;
    let _ = fs::remove_file(&archive);
    info!("Done unpacking kernel headers");

    kernel_headers_dir(toolchain_dir).with_context(|| {
        format!(
            "Kernel headers archive did not contain usr/src/{}*",
            HEADERS_PREFIX
        )
    })
}

/// Write a `CC` wrapper into `work_dir` that drops `-Werror=strict-prototypes`
/// and put it first on the build `PATH`.
pub fn add_cc_wrapper(env: &mut BuildEnv, work_dir: &Path) -> Result<PathBuf> {
    let cc = env.cc().to_string();
    let wrapper = format!(
        "#!/bin/bash\n\
         for arg; do\n  \
           shift\n  \
           if [[ \"${{arg}}\" == \"-Werror=strict-prototypes\" ]]; then continue; fi\n  \
           set -- \"$@\" \"${{arg}}\"\n\
         done\n\
         exec {}/{} \"$@\"\n",
        env.toolchain_bin().display(),
        cc
    );
    fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create dir {}", work_dir.display()))?;
    let path = work_dir.join(&cc);
    fs::write(&path, &wrapper).with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    debug!("Created CC wrapper {}:\n{}", path.display(), wrapper);

    env.prepend_path(work_dir);
    Ok(path)
}

/// Everything needed before linking: compiler variables, toolchain, headers
/// and the CC wrapper.
pub fn acquire(
    downloader: &dyn ArtifactDownloader,
    runner: &dyn ProcessRunner,
    paths: &InstallPaths,
) -> Result<BuildEnv> {
    let mut env = set_compilation_env(downloader, &paths.work_dir)
        .context("Failed to set compilation environment variables")?;
    let headers = install_cross_toolchain(downloader, runner, &paths.toolchain_dir)
        .context("Failed to install toolchain")?;

    env.toolchain_dir = paths.toolchain_dir.clone();
    env.kernel_headers = headers;
    let inherited = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    env.set(
        "PATH",
        format!("{}:{}", env.toolchain_bin().display(), inherited),
    );
    env.set(
        "SYSROOT",
        paths.toolchain_dir.join("usr/x86_64-cros-linux-gnu").display().to_string(),
    );
    env.set("IGNORE_MISSING_MODULE_SYMVERS", "1");
    add_cc_wrapper(&mut env, &paths.work_dir)?;
    Ok(env)
}
