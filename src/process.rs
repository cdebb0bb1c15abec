//! External command execution.
//!
//! Every component that shells out builds a [`Cmd`] and hands it to a
//! [`ProcessRunner`]. Production code passes [`SystemRunner`]; tests pass a
//! recording fake so nothing on the host is touched.
//!
//! # Example
//!
//! ```rust,ignore
//! use gpu_driver_installer::process::{Cmd, SystemRunner};
//!
//! let out = Cmd::new("lsmod")
//!     .error_msg("lsmod failed. Install: kmod")
//!     .run(&SystemRunner)?;
//! println!("{}", out.stdout);
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Something that can execute a [`Cmd`] and report how it went.
///
/// Only failures to spawn are errors at this level. A non-zero exit status is
/// reported through [`CmdResult`] and judged by [`Cmd::run`].
pub trait ProcessRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CmdResult>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CmdResult> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        for (key, value) in &cmd.envs {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }
        command
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning `{}`", cmd))?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)
                    .with_context(|| format!("writing stdin of `{}`", cmd))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for `{}`", cmd))?;

        Ok(CmdResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Outcome of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Builder for an external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    error_msg: Option<String>,
    allow_fail: bool,
    quiet: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stdin: None,
            error_msg: None,
            allow_fail: false,
            quiet: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Feed these bytes to the command's stdin.
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Message used as the head of the error when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Do not echo output to the debug log. For commands that print credentials.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Last value set for an environment variable on this command.
    pub fn env_value(&self, key: &str) -> Option<String> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.to_string_lossy().into_owned())
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Execute through `runner`, failing on non-zero exit unless
    /// [`allow_fail`](Self::allow_fail) was set.
    pub fn run(&self, runner: &dyn ProcessRunner) -> Result<CmdResult> {
        debug!("running `{}`", self);
        let result = runner.execute(self)?;

        if !self.quiet {
            for line in result.stdout.lines().chain(result.stderr.lines()) {
                debug!("  {}", line);
            }
        }

        if !result.success() && !self.allow_fail {
            let head = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("`{}` failed", self));
            let status = match result.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            };
            bail!("{} ({}): {}", head, status, result.stderr.trim());
        }

        Ok(result)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording runner for unit tests.

    use super::*;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&Cmd) -> CmdResult + Send + Sync>;

    /// Records every command and answers with a scripted result.
    pub(crate) struct FakeRunner {
        commands: Mutex<Vec<Cmd>>,
        handler: Handler,
    }

    impl FakeRunner {
        /// Every command succeeds with empty output.
        pub(crate) fn new() -> Self {
            Self::with_handler(|_| CmdResult::ok(""))
        }

        pub(crate) fn with_handler(
            handler: impl Fn(&Cmd) -> CmdResult + Send + Sync + 'static,
        ) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            }
        }

        pub(crate) fn commands(&self) -> Vec<Cmd> {
            self.commands.lock().map(|c| c.clone()).unwrap_or_default()
        }

        /// Command lines in execution order.
        pub(crate) fn calls(&self) -> Vec<String> {
            self.commands().iter().map(|c| c.to_string()).collect()
        }

        pub(crate) fn calls_to(&self, program: &str) -> Vec<String> {
            self.commands()
                .iter()
                .filter(|c| c.program() == program)
                .map(|c| c.to_string())
                .collect()
        }
    }

    impl ProcessRunner for FakeRunner {
        fn execute(&self, cmd: &Cmd) -> Result<CmdResult> {
            if let Ok(mut commands) = self.commands.lock() {
                commands.push(cmd.clone());
            }
            Ok((self.handler)(cmd))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;

    #[test]
    fn test_display_joins_program_and_args() {
        let cmd = Cmd::new("insmod").arg("/tmp/nvidia.ko");
        assert_eq!(cmd.to_string(), "insmod /tmp/nvidia.ko");
    }

    #[test]
    fn test_run_fails_with_error_msg_and_stderr() {
        let runner = FakeRunner::with_handler(|_| CmdResult::failed(1, "no such module"));
        let err = Cmd::new("insmod")
            .arg("x.ko")
            .error_msg("insmod failed")
            .run(&runner)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("insmod failed"));
        assert!(msg.contains("exit status 1"));
        assert!(msg.contains("no such module"));
    }

    #[test]
    fn test_allow_fail_returns_result() {
        let runner = FakeRunner::with_handler(|_| CmdResult::failed(3, ""));
        let result = Cmd::new("false").allow_fail().run(&runner).unwrap();
        assert!(!result.success());
        assert_eq!(result.code, Some(3));
    }

    #[test]
    fn test_stdin_is_not_part_of_command_line() {
        let cmd = Cmd::new("curl")
            .args(["-H", "@-"])
            .stdin("Authorization: Bearer secret\n")
            .quiet();
        assert_eq!(cmd.to_string(), "curl -H @-");
        assert!(cmd.is_quiet());
    }

    #[test]
    fn test_env_value_returns_last_set() {
        let cmd = Cmd::new("make").env("CC", "gcc").env("CC", "clang");
        assert_eq!(cmd.env_value("CC").as_deref(), Some("clang"));
        assert_eq!(cmd.env_value("CXX"), None);
    }

    #[test]
    fn test_system_runner_captures_stdout_and_stdin() {
        let result = Cmd::new("cat")
            .stdin("hello")
            .run(&SystemRunner)
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }
}
