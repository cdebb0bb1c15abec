//! Facts about the host image, read once at startup.
//!
//! The installer runs in a container with the host root filesystem mounted at
//! [`HOST_ROOT`](crate::paths::HOST_ROOT). Build identity comes from the host's
//! `/etc/os-release` and `/etc/lsb-release`; the kernel release comes from
//! `uname(2)`, which reports the host kernel even inside the container.

use anyhow::{bail, Context, Result};
use nix::sys::utsname::uname;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const OS_RELEASE: &str = "etc/os-release";
const LSB_RELEASE: &str = "etc/lsb-release";
const TOOLCHAIN_PATH: &str = "etc/toolchain-path";

/// Release tracks the installer refuses to run on.
pub const UNSUPPORTED_RELEASE_TRACKS: &[&str] = &["dev-channel", "beta-channel"];

/// Parse `KEY=VALUE` lines, trimming surrounding quotes from values.
///
/// Blank lines and `#` comments are skipped. A non-empty line without `=` is
/// an error.
pub fn parse_env_file(contents: &str) -> Result<HashMap<String, String>> {
    let mut envs = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!("Unrecognized env line: {}", line);
        };
        envs.insert(
            key.trim().to_string(),
            value.trim().trim_matches(|c| c == '"' || c == '\'').to_string(),
        );
    }
    Ok(envs)
}

pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_env_file(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Build identity and kernel release of the host.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    os_release: HashMap<String, String>,
    lsb_release: HashMap<String, String>,
    toolchain_path: Option<String>,
    kernel_release: String,
}

impl HostEnv {
    /// Read host facts from the filesystem mounted at `host_root`.
    pub fn read(host_root: &Path) -> Result<Self> {
        let os_release = load_env_file(&host_root.join(OS_RELEASE))?;
        let lsb_release = load_env_file(&host_root.join(LSB_RELEASE))?;
        let toolchain_path = fs::read_to_string(host_root.join(TOOLCHAIN_PATH))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let kernel_release = uname_release()?;

        Ok(Self {
            os_release,
            lsb_release,
            toolchain_path,
            kernel_release,
        })
    }

    pub fn from_parts(
        os_release: HashMap<String, String>,
        lsb_release: HashMap<String, String>,
        toolchain_path: Option<String>,
        kernel_release: impl Into<String>,
    ) -> Self {
        Self {
            os_release,
            lsb_release,
            toolchain_path,
            kernel_release: kernel_release.into(),
        }
    }

    /// Build number, e.g. `11647.415.0`.
    pub fn build_number(&self) -> &str {
        self.os_release.get("BUILD_ID").map_or("", String::as_str)
    }

    /// Milestone, e.g. `73`.
    pub fn milestone(&self) -> &str {
        self.os_release.get("VERSION").map_or("", String::as_str)
    }

    pub fn release_track(&self) -> &str {
        self.lsb_release
            .get("CHROMEOS_RELEASE_TRACK")
            .map_or("", String::as_str)
    }

    pub fn board(&self) -> &str {
        self.lsb_release
            .get("CHROMEOS_RELEASE_BOARD")
            .map_or("", String::as_str)
    }

    /// Toolchain object path inside the SDK bucket, absent on older images.
    pub fn toolchain_path(&self) -> Option<&str> {
        self.toolchain_path.as_deref()
    }

    pub fn kernel_release(&self) -> &str {
        &self.kernel_release
    }

    pub fn is_supported_release_track(&self) -> bool {
        !UNSUPPORTED_RELEASE_TRACKS.contains(&self.release_track())
    }
}

fn uname_release() -> Result<String> {
    let uts = uname().context("uname failed")?;
    Ok(uts.release().to_string_lossy().into_owned())
}

/// Whether the kernel command line turns off module signature enforcement.
pub fn signature_enforcement_disabled(cmdline: &str) -> bool {
    let args: Vec<&str> = cmdline.split_whitespace().collect();
    ["module.sig_enforce=0", "loadpin.enforce=0"]
        .iter()
        .all(|opt| args.contains(opt))
}
