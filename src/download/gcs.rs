use super::{extension_path, file_name, ArtifactDownloader, TOOLCHAIN_ARCHIVE, TOOLCHAIN_URL};
use crate::errors::InstallError;
use crate::host::HostEnv;
use crate::process::{Cmd, ProcessRunner};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Public bucket holding per-build artifacts.
pub const COS_TOOLS_BUCKET: &str = "cos-tools";
/// Internal staging bucket, consulted only when internal download is enabled.
pub const INTERNAL_BUCKET: &str = "container-vm-image-staging";

const STORAGE_HOST: &str = "https://storage.googleapis.com";
const SDK_BUCKET: &str = "chromiumos-sdk";
const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListObjectsResponse {
    #[serde(default)]
    items: Vec<StorageObject>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageObject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

/// Downloads build artifacts from Cloud Storage through `curl`.
pub struct GcsDownloader<'a> {
    runner: &'a dyn ProcessRunner,
    build_number: String,
    milestone: String,
    toolchain_path: Option<String>,
    bucket: String,
    prefix: Option<String>,
    internal: bool,
}

impl<'a> GcsDownloader<'a> {
    /// `bucket` and `prefix` override the public location; the prefix
    /// defaults to the build number.
    pub fn new(
        runner: &'a dyn ProcessRunner,
        host: &HostEnv,
        bucket: Option<&str>,
        prefix: Option<&str>,
        internal: bool,
    ) -> Self {
        Self {
            runner,
            build_number: host.build_number().to_string(),
            milestone: host.milestone().to_string(),
            toolchain_path: host.toolchain_path().map(str::to_string),
            bucket: bucket
                .filter(|b| !b.is_empty())
                .unwrap_or(COS_TOOLS_BUCKET)
                .to_string(),
            prefix: prefix.filter(|p| !p.is_empty()).map(|p| p.trim_end_matches('/').to_string()),
            internal,
        }
    }

    fn public_path(&self, name: &str) -> String {
        let base = self.prefix.as_deref().unwrap_or(&self.build_number);
        format!("{}/{}", base, name)
    }

    fn internal_path(&self, name: &str) -> String {
        format!("lakitu-release/R{}-{}/{}", self.milestone, self.build_number, name)
    }

    fn object_url(bucket: &str, object: &str) -> String {
        format!("{}/{}/{}", STORAGE_HOST, bucket, object)
    }

    /// Bearer token of the instance service account, if the metadata
    /// server hands one out.
    fn access_token(&self) -> Option<String> {
        let raw = match Self::metadata_cmd("service-accounts/default/token")
            .quiet()
            .run(self.runner)
        {
            Ok(out) => out.stdout,
            Err(e) => {
                debug!("No instance access token, downloading anonymously: {:#}", e);
                return None;
            }
        };
        match serde_json::from_str::<AccessToken>(&raw) {
            Ok(token) => Some(token.access_token),
            Err(e) => {
                debug!("Unparsable access token response: {}", e);
                None
            }
        }
    }

    fn metadata_cmd(key: &str) -> Cmd {
        Cmd::new("curl")
            .args(["-sS", "-f", "-H", "Metadata-Flavor: Google"])
            .arg(format!("{}/{}", METADATA_URL, key))
            .error_msg(format!("Failed to get instance metadata {}", key))
    }

    fn metadata(&self, key: &str) -> Result<String> {
        let out = Self::metadata_cmd(key).run(self.runner)?;
        Ok(out.stdout.trim().to_string())
    }

    /// The bearer header goes through stdin (`-H @-`) so the token stays out
    /// of the process table and the logged command line.
    fn curl(&self, url: &str) -> Cmd {
        let mut cmd = Cmd::new("curl").args(["-sS", "-L", "-w", "%{http_code}"]);
        if url.starts_with(STORAGE_HOST) {
            if let Some(token) = self.access_token() {
                cmd = cmd
                    .args(["-H", "@-"])
                    .stdin(format!("Authorization: Bearer {}\n", token));
            }
        }
        cmd
    }

    /// Download `url` to `out`. A 404 becomes `ArtifactNotFound`.
    fn fetch_to_file(&self, url: &str, out: &Path) -> Result<()> {
        info!("Downloading {}", url);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let result = self
            .curl(url)
            .arg("-o")
            .arg_path(out)
            .arg(url)
            .error_msg(format!("Failed to download {}", url))
            .run(self.runner)?;

        let status = result.stdout.trim();
        if status != "200" {
            let _ = fs::remove_file(out);
            if status == "404" {
                return Err(InstallError::ArtifactNotFound(url.to_string()).into());
            }
            bail!("Failed to download {}: HTTP status {}", url, status);
        }
        debug!("Downloaded {} to {}", url, out.display());
        Ok(())
    }

    /// Fetch `url` and return the body.
    fn fetch_to_string(&self, url: &str) -> Result<String> {
        let tmp = tempfile::tempdir().context("Failed to create temp dir")?;
        let out = tmp.path().join("body");
        self.fetch_to_file(url, &out)?;
        fs::read_to_string(&out).with_context(|| format!("Failed to read response of {}", url))
    }

    fn download_from(&self, bucket: &str, object: &str, dest: &Path) -> Result<PathBuf> {
        let out = dest.join(file_name(object));
        self.fetch_to_file(&Self::object_url(bucket, object), &out)?;
        Ok(out)
    }

    fn list_bucket(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        debug!("Listing objects in {} with prefix {}", bucket, prefix);
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!("{}/storage/v1/b/{}/o?prefix={}", STORAGE_HOST, bucket, prefix);
            if let Some(token) = &page_token {
                url.push_str("&pageToken=");
                url.push_str(token);
            }
            let body = self.fetch_to_string(&url)?;
            let page: ListObjectsResponse = serde_json::from_str(&body)
                .with_context(|| format!("Failed to parse object listing of {}", bucket))?;
            names.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(names)
    }

    fn toolchain_url(&self) -> Result<String> {
        if let Some(path) = &self.toolchain_path {
            debug!("Using toolchain path from host: {}", path);
            return Ok(Self::object_url(SDK_BUCKET, path));
        }
        let content = self
            .get_artifact(TOOLCHAIN_URL)
            .context("Failed to get toolchain URL")?;
        Ok(String::from_utf8_lossy(&content).trim().to_string())
    }
}

impl ArtifactDownloader for GcsDownloader<'_> {
    fn download_artifact(&self, dest: &Path, name: &str) -> Result<PathBuf> {
        let public = self.download_from(&self.bucket, &self.public_path(name), dest);
        let err = match public {
            Ok(path) => return Ok(path),
            Err(e) => e,
        };
        if !self.internal {
            return Err(err).with_context(|| format!("Failed to download {}", name));
        }
        warn!("Failed to download {} from {}: {:#}", name, self.bucket, err);
        self.download_from(INTERNAL_BUCKET, &self.internal_path(name), dest)
            .with_context(|| format!("Failed to download {}", name))
    }

    fn get_artifact(&self, name: &str) -> Result<Vec<u8>> {
        let tmp = tempfile::tempdir().context("Failed to create temp dir")?;
        let path = self.download_artifact(tmp.path(), name)?;
        fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    fn download_toolchain(&self, dest: &Path) -> Result<PathBuf> {
        let url = self.toolchain_url()?;
        let out = dest.join(TOOLCHAIN_ARCHIVE);
        self.fetch_to_file(&url, &out)
            .context("Failed to download toolchain")?;
        Ok(out)
    }

    fn list_extension_artifacts(&self, extension: &str) -> Result<Vec<String>> {
        let dir = extension_path(extension, "");
        let mut sources = vec![(self.bucket.clone(), self.public_path(&dir))];
        if self.internal {
            sources.push((INTERNAL_BUCKET.to_string(), self.internal_path(&dir)));
        }

        let mut last_err = None;
        for (bucket, prefix) in sources {
            match self.list_bucket(&bucket, &prefix) {
                Ok(objects) if !objects.is_empty() => {
                    return Ok(objects
                        .iter()
                        .filter_map(|o| o.strip_prefix(prefix.as_str()))
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect());
                }
                Ok(_) => debug!("No {} artifacts in {}/{}", extension, bucket, prefix),
                Err(e) => {
                    warn!("Failed to list {} artifacts in {}: {:#}", extension, bucket, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e).with_context(|| format!("Failed to list {} extension artifacts", extension)),
            None => Ok(Vec::new()),
        }
    }

    fn download_url(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        let out = dest.join(file_name(url));
        self.fetch_to_file(url.trim(), &out)?;
        Ok(out)
    }

    fn instance_zone(&self) -> Result<String> {
        self.metadata("zone")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_not_found;
    use crate::process::testing::FakeRunner;
    use crate::process::CmdResult;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn host() -> HostEnv {
        let os = HashMap::from([
            ("BUILD_ID".to_string(), "11647.415.0".to_string()),
            ("VERSION".to_string(), "73".to_string()),
        ]);
        HostEnv::from_parts(os, HashMap::new(), None, "4.19.112+")
    }

    fn output_path(cmd: &Cmd) -> Option<String> {
        let args = cmd.arg_strings();
        args.iter()
            .position(|a| a == "-o")
            .and_then(|i| args.get(i + 1).cloned())
    }

    /// Serves `body` with status 200 for URLs containing `needle`, 404 otherwise.
    fn serving(needle: &'static str, body: &'static str) -> FakeRunner {
        FakeRunner::with_handler(move |cmd| {
            let args = cmd.arg_strings();
            if args.iter().any(|a| a.starts_with(METADATA_URL)) {
                return CmdResult::failed(6, "could not resolve host");
            }
            let url = args.last().cloned().unwrap_or_default();
            if !url.contains(needle) {
                return CmdResult::ok("404");
            }
            if let Some(out) = output_path(cmd) {
                fs::write(out, body).unwrap();
            }
            CmdResult::ok("200")
        })
    }

    #[test]
    fn test_public_path_uses_prefix_or_build() {
        let runner = FakeRunner::new();
        let env = host();
        let d = GcsDownloader::new(&runner, &env, None, None, false);
        assert_eq!(d.public_path("gpu_default_version"), "11647.415.0/gpu_default_version");
        let d = GcsDownloader::new(&runner, &env, Some("my-bucket"), Some("custom/dir/"), false);
        assert_eq!(d.public_path("x"), "custom/dir/x");
        assert_eq!(d.bucket, "my-bucket");
        assert_eq!(d.internal_path("x"), "lakitu-release/R73-11647.415.0/x");
    }

    #[test]
    fn test_get_artifact_reads_public_object() -> Result<()> {
        let runner = serving("cos-tools/11647.415.0/gpu_default_version", "418.67\n");
        let env = host();
        let d = GcsDownloader::new(&runner, &env, None, None, false);
        assert_eq!(d.get_artifact("gpu_default_version")?, b"418.67\n");
        Ok(())
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let runner = serving("never-matches", "");
        let env = host();
        let d = GcsDownloader::new(&runner, &env, None, None, false);
        let tmp = TempDir::new().unwrap();
        let err = d.download_artifact(tmp.path(), "toolchain_env").unwrap_err();
        assert!(is_not_found(&err));
        assert!(!tmp.path().join("toolchain_env").exists());
    }

    #[test]
    fn test_internal_fallback_when_enabled() -> Result<()> {
        let runner = serving("container-vm-image-staging/lakitu-release/R73-11647.415.0/", "x");
        let env = host();
        let tmp = TempDir::new()?;

        let d = GcsDownloader::new(&runner, &env, None, None, true);
        let path = d.download_artifact(tmp.path(), "kernel-headers.tgz")?;
        assert_eq!(path, tmp.path().join("kernel-headers.tgz"));

        let d = GcsDownloader::new(&runner, &env, None, None, false);
        assert!(d.download_artifact(tmp.path(), "kernel-headers.tgz").is_err());
        Ok(())
    }

    #[test]
    fn test_list_extension_artifacts_strips_prefix() -> Result<()> {
        let body = r#"{"items":[
            {"name":"11647.415.0/extensions/gpu/418.67.signature.tar.gz"},
            {"name":"11647.415.0/extensions/gpu/450.51.06.signature.tar.gz"}
        ]}"#;
        let runner = serving("storage/v1/b/cos-tools/o?prefix=11647.415.0/extensions/gpu/", body);
        let env = host();
        let d = GcsDownloader::new(&runner, &env, None, None, false);
        assert_eq!(
            d.list_extension_artifacts("gpu")?,
            vec!["418.67.signature.tar.gz", "450.51.06.signature.tar.gz"]
        );
        Ok(())
    }

    #[test]
    fn test_access_token_stays_off_the_command_line() -> Result<()> {
        let runner = FakeRunner::with_handler(|cmd| {
            let args = cmd.arg_strings();
            if args.iter().any(|a| a.ends_with("service-accounts/default/token")) {
                return CmdResult::ok(r#"{"access_token":"ya29.SECRET","expires_in":3599}"#);
            }
            if let Some(out) = output_path(cmd) {
                fs::write(out, "418.67\n").unwrap();
            }
            CmdResult::ok("200")
        });
        let env = host();
        let d = GcsDownloader::new(&runner, &env, None, None, false);
        assert_eq!(d.get_artifact("gpu_default_version")?, b"418.67\n");

        assert!(runner.calls().iter().all(|c| !c.contains("SECRET")));
        let commands = runner.commands();
        let token_request = commands
            .iter()
            .find(|c| c.to_string().contains("default/token"))
            .unwrap();
        assert!(token_request.is_quiet());
        let download = commands.iter().find(|c| output_path(c).is_some()).unwrap();
        assert!(download.arg_strings().contains(&"@-".to_string()));
        assert_eq!(
            download.stdin_bytes(),
            Some(&b"Authorization: Bearer ya29.SECRET\n"[..])
        );
        Ok(())
    }

    #[test]
    fn test_toolchain_url_prefers_host_path() -> Result<()> {
        let runner = serving("chromiumos-sdk/2019/11/x86_64-cros-linux-gnu.tar.xz", "xz");
        let env = HostEnv::from_parts(
            HashMap::new(),
            HashMap::new(),
            Some("2019/11/x86_64-cros-linux-gnu.tar.xz".to_string()),
            "4.19.112+",
        );
        let tmp = TempDir::new()?;
        let d = GcsDownloader::new(&runner, &env, None, None, false);
        let path = d.download_toolchain(tmp.path())?;
        assert_eq!(path, tmp.path().join("toolchain.tar.xz"));
        assert_eq!(fs::read(path)?, b"xz");
        Ok(())
    }
}
