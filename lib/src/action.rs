//! Command execution on local and remote targets.

pub mod client;
pub mod engine;
pub mod parallel;
pub mod prepare;
pub mod result;
pub mod transport;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use regex::Regex;
use tracing::debug;
use tracing::info;

use crate::action::engine::ExecHandle;
use crate::action::result::ExecResult;
use crate::action::result::ExitCode;
use crate::resolve::TargetKey;
use crate::util::mask::mask_all;
use crate::Error;
use crate::Result;

pub use client::LocalExec;
pub use client::SshClient;
pub use parallel::run_together;

/// Pseudo-terminal size in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub width: u32,
    pub height: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Exit codes a caller accepts as success. Defaults to `{0}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedCodes(BTreeSet<ExitCode>);

impl ExpectedCodes {
    pub fn new(codes: impl IntoIterator<Item = impl Into<ExitCode>>) -> Self {
        Self(codes.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn contains(&self, code: Option<ExitCode>) -> bool {
        code.is_some_and(|code| self.0.contains(&code))
    }

    /// Passes `result` through, or fails with [`Error::CalledProcess`] when
    /// its exit code is unexpected and `raise` is set.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn check(&self, result: ExecResult, raise: bool) -> Result<ExecResult> {
        if raise && !self.contains(result.exit_code()) {
            return Err(Error::CalledProcess {
                result: Box::new(result),
                expected: self.clone(),
            });
        }
        Ok(result)
    }
}

impl Default for ExpectedCodes {
    fn default() -> Self {
        Self(BTreeSet::from([ExitCode::OK]))
    }
}

impl FromIterator<ExitCode> for ExpectedCodes {
    fn from_iter<T: IntoIterator<Item = ExitCode>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ExpectedCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, code) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{code}")?;
        }
        f.write_str("]")
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Builder)]
pub struct ExecOptions {
    /// Deadline for the command. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Data written to the command's standard input right after start.
    #[builder(into)]
    pub stdin: Option<Vec<u8>>,

    #[builder(default = true)]
    pub open_stdout: bool,

    #[builder(default = true)]
    pub open_stderr: bool,

    pub pty: Option<PtySize>,

    /// Chroot for this call, overriding the executor's own.
    #[builder(into)]
    pub chroot: Option<String>,

    /// Log the command and its result at info instead of debug.
    #[builder(default)]
    pub verbose: bool,

    /// Capture groups to hide from logs, on top of the executor's mask.
    pub mask: Option<Regex>,

    #[builder(default)]
    pub expected: ExpectedCodes,

    /// Fail on unexpected exit codes in [`Exec::check_call`].
    #[builder(default = true)]
    pub raise_on_err: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A place commands can run: this machine, a remote host, or a host behind
/// jump hosts.
#[async_trait]
pub trait Exec: Send + Sync {
    /// Host and port identifying this target in aggregated results.
    fn target(&self) -> TargetKey;

    /// Mask applied to every command logged by this executor.
    fn log_mask(&self) -> Option<&Regex> {
        None
    }

    /// Rewrites `command` for the executor's current mode and `chroot`.
    fn prepare_command(&self, command: &str, chroot: Option<&str>) -> String;

    /// Starts `command` without waiting for it.
    async fn start(&self, command: &str, options: &ExecOptions) -> Result<ExecHandle>;

    /// `command` with every configured mask applied.
    fn masked(&self, command: &str, options: &ExecOptions) -> String {
        mask_all(command, self.log_mask().into_iter().chain(options.mask.as_ref()))
    }

    /// Runs `command` to completion within `options.timeout`.
    async fn execute(&self, command: &str, options: &ExecOptions) -> Result<ExecResult> {
        let cmd = self.masked(command, options);
        log_command(&self.target(), &cmd, options.verbose);

        let mut handle = self.start(command, options).await?;
        let result = engine::run_to_completion(&cmd, &mut handle, options.timeout).await?;

        log_result(&self.target(), &result, options.verbose);
        Ok(result)
    }

    /// Like [`Exec::execute`], failing on exit codes outside
    /// `options.expected` when `options.raise_on_err` is set.
    async fn check_call(&self, command: &str, options: &ExecOptions) -> Result<ExecResult> {
        let result = self.execute(command, options).await?;
        options.expected.check(result, options.raise_on_err)
    }

    /// Like [`Exec::check_call`], also failing when anything was written to
    /// standard error.
    async fn check_stderr(&self, command: &str, options: &ExecOptions) -> Result<ExecResult> {
        let result = self.check_call(command, options).await?;
        if options.raise_on_err && !result.stderr().is_empty() {
            return Err(Error::CalledProcess {
                result: Box::new(result),
                expected: options.expected.clone(),
            });
        }
        Ok(result)
    }
}

pub(crate) fn log_command(target: &TargetKey, cmd: &str, verbose: bool) {
    if verbose {
        info!(%target, "Executing command:\n{cmd:?}");
    } else {
        debug!(%target, "Executing command:\n{cmd:?}");
    }
}

pub(crate) fn log_result(target: &TargetKey, result: &ExecResult, verbose: bool) {
    let code = result
        .exit_code()
        .map_or_else(|| "<unset>".to_owned(), |code| code.to_string());
    if verbose {
        info!(%target, exit_code = %code, "Command {:?} finished", result.cmd());
    } else {
        debug!(%target, exit_code = %code, "Command {:?} finished", result.cmd());
    }
}

// Tests ----------------------------------------------------------------------
