use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use regex::Regex;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tracing::debug;

use crate::action::engine::Capture;
use crate::action::engine::ExecHandle;
use crate::action::engine::Process;
use crate::action::engine::ProcessEvent;
use crate::action::engine::Spawned;
use crate::action::engine::Stdin;
use crate::action::prepare::chrooted;
use crate::action::result::ExitCode;
use crate::action::Exec;
use crate::action::ExecOptions;
use crate::resolve::TargetKey;
use crate::Result;

/// Time between SIGTERM and SIGKILL when a local command is force-closed.
const TERM_GRACE: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 8 * 1024;

// Executor -------------------------------------------------------------------

/// Runs commands on this machine through `sh -c`.
#[derive(Debug, Clone, Default, Builder)]
pub struct LocalExec {
    #[builder(into)]
    chroot: Option<String>,

    log_mask: Option<Regex>,

    #[builder(into)]
    cwd: Option<PathBuf>,

    #[builder(default)]
    env: BTreeMap<String, String>,
}

#[async_trait]
impl Exec for LocalExec {
    fn target(&self) -> TargetKey {
        TargetKey::local()
    }

    fn log_mask(&self) -> Option<&Regex> {
        self.log_mask.as_ref()
    }

    fn prepare_command(&self, command: &str, chroot: Option<&str>) -> String {
        chrooted(command, chroot.or(self.chroot.as_deref()))
    }

    async fn start(&self, command: &str, options: &ExecOptions) -> Result<ExecHandle> {
        let prepared = self.prepare_command(command, options.chroot.as_deref());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&prepared)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(piped_if(options.open_stdout))
            .stderr(piped_if(options.open_stderr))
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        debug!(pid = ?child.id(), "started local command");

        let stdin = child.stdin.take().map(|stdin| Box::new(stdin) as Stdin);
        let process = LocalProcess {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            exited: false,
        };
        let capture = Capture {
            stdout: options.open_stdout,
            stderr: options.open_stderr,
        };
        let mut handle = ExecHandle::new(
            Spawned {
                process: Box::new(process),
                stdin,
            },
            capture,
        );
        if let Some(data) = &options.stdin {
            handle.write_stdin(data).await;
        }
        Ok(handle)
    }
}

fn piped_if(open: bool) -> Stdio {
    if open {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

// Process --------------------------------------------------------------------

struct LocalProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exited: bool,
}

enum Read {
    Stdout(usize),
    Stderr(usize),
}

#[async_trait]
impl Process for LocalProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>> {
        let mut out = [0; READ_CHUNK];
        let mut err = [0; READ_CHUNK];

        while self.stdout.is_some() || self.stderr.is_some() {
            let read = tokio::select! {
                read = read_some(&mut self.stdout, &mut out) => Read::Stdout(read?),
                read = read_some(&mut self.stderr, &mut err) => Read::Stderr(read?),
            };
            match read {
                Read::Stdout(0) => self.stdout = None,
                Read::Stderr(0) => self.stderr = None,
                Read::Stdout(n) => return Ok(Some(ProcessEvent::Stdout(out[..n].to_vec()))),
                Read::Stderr(n) => return Ok(Some(ProcessEvent::Stderr(err[..n].to_vec()))),
            }
        }

        if self.exited {
            return Ok(None);
        }
        let status = self.child.wait().await?;
        self.exited = true;
        Ok(Some(ProcessEvent::Exit(exit_code(status))))
    }

    async fn close(&mut self) -> Result<()> {
        self.stdout = None;
        self.stderr = None;
        if self.exited || self.child.try_wait()?.is_some() {
            self.exited = true;
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::killpg;
            use nix::sys::signal::Signal;
            use nix::unistd::Pid;

            let group = Pid::from_raw(pid);
            if let Err(error) = killpg(group, Signal::SIGTERM) {
                debug!(?error, "SIGTERM to process group failed");
            }
            if tokio::time::timeout(TERM_GRACE, self.child.wait()).await.is_ok() {
                self.exited = true;
                return Ok(());
            }
            if let Err(error) = killpg(group, Signal::SIGKILL) {
                debug!(?error, "SIGKILL to process group failed");
            }
        }

        self.child.kill().await?;
        self.exited = true;
        Ok(())
    }
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        return ExitCode::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitCode::from_signal(signal);
        }
    }
    ExitCode::INVALID
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rstest::rstest;

    use super::*;
    use crate::Error;

    fn within(secs: u64) -> ExecOptions {
        ExecOptions::builder()
            .timeout(Duration::from_secs(secs))
            .build()
    }

    #[tokio::test]
    async fn echo() {
        let result = LocalExec::default()
            .execute("echo hi", &within(5))
            .await
            .unwrap();

        assert_eq!(result.exit_code(), Some(ExitCode::OK));
        assert_eq!(result.stdout_str(), "hi\n");
        assert_eq!(result.stderr_str(), "");
    }

    #[rstest]
    #[case::ok("true", 0)]
    #[case::error("exit 3", 3)]
    #[case::not_found("definitely-not-a-command-x", 127)]
    #[case::killed("kill -9 $$", 137)]
    #[tokio::test]
    async fn exit_codes(#[case] command: &str, #[case] code: i64) {
        let result = LocalExec::default().execute(command, &within(5)).await.unwrap();
        assert_eq!(result.exit_code(), Some(ExitCode::new(code)));
    }

    #[tokio::test]
    async fn stdin_is_fed() {
        let options = ExecOptions::builder()
            .timeout(Duration::from_secs(5))
            .stdin(b"from stdin".to_vec())
            .build();
        let result = LocalExec::default().execute("cat", &options).await.unwrap();
        assert_eq!(result.stdout_str(), "from stdin");
    }

    #[tokio::test]
    async fn both_streams_are_captured() {
        let result = LocalExec::default()
            .execute("echo out; echo err >&2", &within(5))
            .await
            .unwrap();
        assert_eq!(result.stdout_str(), "out\n");
        assert_eq!(result.stderr_str(), "err\n");
    }

    #[tokio::test]
    async fn suppressed_stdout() {
        let options = ExecOptions::builder()
            .timeout(Duration::from_secs(5))
            .open_stdout(false)
            .build();
        let result = LocalExec::default()
            .execute("echo out; echo err >&2", &options)
            .await
            .unwrap();
        assert!(result.stdout().is_empty());
        assert_eq!(result.stderr_str(), "err\n");
    }

    #[tokio::test]
    async fn timeout_kills_long_command() {
        let started = Instant::now();
        let error = LocalExec::default()
            .execute("echo begin; sleep 10", &within(1))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        let Error::Timeout { result, timeout } = error else {
            panic!("expected timeout, got {error:?}");
        };
        assert_eq!(timeout, Duration::from_secs(1));
        assert!(result.exit_code().is_none());
        assert_eq!(result.stdout_str(), "begin\n");
    }

    #[tokio::test]
    async fn check_call_raises_on_unexpected_code() {
        let error = LocalExec::default()
            .check_call("exit 2", &within(5))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::CalledProcess { ref result, .. }
            if result.exit_code() == Some(ExitCode::MISUSE)));
    }

    #[tokio::test]
    async fn check_stderr_raises_on_output() {
        let error = LocalExec::default()
            .check_stderr("echo oops >&2", &within(5))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::CalledProcess { .. }));
    }

    #[tokio::test]
    async fn env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalExec::builder()
            .cwd(dir.path())
            .env(BTreeMap::from([("GREETING".to_owned(), "hello".to_owned())]))
            .build();
        let result = local
            .execute("echo $GREETING; pwd", &within(5))
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            result.stdout_str(),
            format!("hello\n{}\n", canonical.display())
        );
    }

    #[test]
    fn chroot_override_wins() {
        let local = LocalExec::builder().chroot("/srv/default").build();
        assert!(local.prepare_command("ls", None).starts_with("chroot '/srv/default'"));
        assert!(local
            .prepare_command("ls", Some("/srv/call"))
            .starts_with("chroot '/srv/call'"));
    }
}
