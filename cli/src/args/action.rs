use anyhow::Context;
use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Args;
use jumpexec::action::result::ExitCode;
use jumpexec::action::ExecOptions;
use jumpexec::action::PtySize;
use jumpexec::resolve::HostsConfig;
use regex::Regex;

const HEADING: Option<&str> = Some("Action Options");

/// Arguments for action execution.
#[derive(Debug, Args, Clone)]
pub struct ActionArgs {
    /// Time to allow the command to complete. Shared by all targets.
    #[clap(long, default_value = "1h", help_heading = HEADING)]
    pub timeout: humantime::Duration,

    /// Exit codes counted as success.
    #[clap(long = "expect", value_delimiter = ',', default_value = "0", help_heading = HEADING)]
    pub expected: Vec<i64>,

    /// Report unexpected exit codes without failing.
    #[clap(long, help_heading = HEADING)]
    pub no_raise: bool,

    /// Run through sudo, entering the password on stdin.
    #[clap(long, help_heading = HEADING)]
    pub sudo: bool,

    /// Run inside this chroot.
    #[clap(long, help_heading = HEADING)]
    pub chroot: Option<String>,

    /// Regex whose capture groups are hidden from logs.
    #[clap(long, help_heading = HEADING)]
    pub mask: Option<Regex>,

    /// JSON table of host aliases, keyed by alias.
    #[clap(long, env = "JUMPEXEC_HOSTS", help_heading = HEADING)]
    pub hosts_file: Option<Utf8PathBuf>,

    /// Keepalive period. Zero disables keepalive.
    #[clap(long, default_value = "1s", help_heading = HEADING)]
    pub keepalive: humantime::Duration,

    /// Allocate a pseudo-terminal.
    #[clap(long, help_heading = HEADING)]
    pub pty: bool,

    /// Log commands and results at info level.
    #[clap(short, long, help_heading = HEADING)]
    pub verbose: bool,
}

impl ActionArgs {
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions::builder()
            .timeout(self.timeout.into())
            .maybe_pty(self.pty.then(PtySize::default))
            .maybe_chroot(self.chroot.clone())
            .verbose(self.verbose)
            .maybe_mask(self.mask.clone())
            .expected(self.expected.iter().copied().map(ExitCode::new).collect())
            .raise_on_err(!self.no_raise)
            .build()
    }

    pub fn hosts(&self) -> Result<HostsConfig> {
        let Some(path) = &self.hosts_file else {
            return Ok(HostsConfig::default());
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("unable to read {path}"))?;
        serde_json::from_str(&text).with_context(|| format!("invalid hosts file {path}"))
    }
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        action: ActionArgs,
    }

    #[test]
    fn defaults() {
        let harness = Harness::parse_from(["test"]);
        let options = harness.action.exec_options();
        assert_eq!(options.timeout, Some(Duration::from_secs(3600)));
        assert!(options.raise_on_err);
        assert!(options.pty.is_none());
        assert_eq!(options.expected.to_string(), "[EX_OK<0>]");
    }

    #[test]
    fn expected_codes() {
        let harness = Harness::parse_from(["test", "--expect", "0,2", "--no-raise"]);
        let options = harness.action.exec_options();
        assert!(options.expected.contains(Some(ExitCode::MISUSE)));
        assert!(!options.raise_on_err);
    }

    #[test]
    fn hosts_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"db": {{"hostname": "db.lan", "proxyjump": "bastion"}}, "bastion": {{}}}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let harness = Harness::parse_from(["test", "--hosts-file", path]);
        let hosts = harness.action.hosts().unwrap();
        assert!(hosts.contains("db"));
        assert!(hosts.contains("bastion"));
    }
}
