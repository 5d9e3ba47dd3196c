//! Drives a started command to completion under a deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::action::result::ExecResult;
use crate::action::result::ExitCode;
use crate::Error;
use crate::Result;

/// Time a cancelled worker gets to close its channel and return.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Writable standard input of a running command.
pub type Stdin = Box<dyn AsyncWrite + Send + Unpin>;

/// Something a running command reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(ExitCode),
}

/// Control side of a running command: a remote channel or a local child.
#[async_trait]
pub trait Process: Send {
    /// Waits for the next event. `None` once the process and its streams are
    /// gone.
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>>;

    /// Closes the channel, killing the command if it still runs.
    async fn close(&mut self) -> Result<()>;
}

/// A freshly started command as returned by a transport.
pub struct Spawned {
    pub process: Box<dyn Process>,
    pub stdin: Option<Stdin>,
}

/// Streams the caller asked to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
        }
    }
}

enum Outcome {
    Completed(ExecResult),
    TimedOut(ExecResult, Duration),
}

/// Handle to a started command, owned by whoever drives it to completion.
pub struct ExecHandle {
    process: Option<Box<dyn Process>>,
    stdin: Option<Stdin>,
    capture: Capture,
    started: DateTime<Utc>,
    outcome: Option<Outcome>,
}

impl ExecHandle {
    #[must_use]
    pub fn new(spawned: Spawned, capture: Capture) -> Self {
        Self {
            process: Some(spawned.process),
            stdin: spawned.stdin,
            capture,
            started: Utc::now(),
            outcome: None,
        }
    }

    #[must_use]
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    #[must_use]
    pub fn capture(&self) -> Capture {
        self.capture
    }

    /// Whether standard input can still be written.
    #[must_use]
    pub fn stdin_open(&self) -> bool {
        self.stdin.is_some()
    }

    pub fn stdin(&mut self) -> Option<&mut Stdin> {
        self.stdin.as_mut()
    }

    /// Writes and flushes `data`. A closed input is logged and ignored since
    /// the command may not need it.
    pub async fn write_stdin(&mut self, data: &[u8]) {
        let Some(stdin) = self.stdin.as_mut() else {
            warn!("stdin is closed, dropping {} bytes of input", data.len());
            return;
        };
        let written = async {
            stdin.write_all(data).await?;
            stdin.flush().await
        };
        if let Err(error) = written.await {
            warn!(?error, "stdin was closed by the command");
            self.stdin = None;
        }
    }

    /// Signals end of input.
    pub async fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(error) = stdin.shutdown().await {
                debug!(?error, "stdin already closed");
            }
        }
    }
}

/// Waits for the command behind `handle` and collects its output.
///
/// A worker task owns the process and is the only writer of the result while
/// the command runs. When `timeout` elapses first the worker is told to stop,
/// closes the channel and gets [`CANCEL_GRACE`] to return; the call then fails
/// with [`Error::Timeout`] carrying whatever was captured, unless an exit
/// status was already received, in which case the result stands. `None` waits
/// forever and a zero timeout fails without waiting.
///
/// Standard input is closed before waiting. Calling this again on the same
/// handle replays the first outcome without touching the streams.
///
/// Dropping the returned future also stops the worker.
///
/// # Errors
///
/// - [`Error::Timeout`] if the deadline passes
/// - Whatever the process reports while being drained
pub async fn run_to_completion(
    cmd: &str,
    handle: &mut ExecHandle,
    timeout: Option<Duration>,
) -> Result<ExecResult> {
    match &handle.outcome {
        Some(Outcome::Completed(result)) => return Ok(result.clone()),
        Some(Outcome::TimedOut(result, timeout)) => {
            return Err(Error::Timeout {
                result: Box::new(result.clone()),
                timeout: *timeout,
            })
        }
        None => {}
    }
    let Some(process) = handle.process.take() else {
        return Err(Error::Finalized(cmd.to_owned()));
    };
    handle.close_stdin().await;

    let result = Arc::new(Mutex::new(ExecResult::started_at(cmd, handle.started)));
    let done = CancellationToken::new();
    let _stop_on_drop = done.clone().drop_guard();
    let mut worker = tokio::spawn(drain(
        process,
        Arc::clone(&result),
        handle.capture,
        done.clone(),
    ));

    let joined = match timeout {
        Some(limit) if limit.is_zero() => None,
        Some(limit) => tokio::time::timeout(limit, &mut worker).await.ok(),
        None => Some((&mut worker).await),
    };

    if let Some(joined) = joined {
        joined.map_err(|error| Error::Io(std::io::Error::other(error)))??;
        let result = result.lock().clone();
        handle.outcome = Some(Outcome::Completed(result.clone()));
        return Ok(result);
    }

    let timeout = timeout.unwrap_or_default();
    done.cancel();
    stop(worker).await;

    // The exit status may have landed while the worker was being stopped.
    let mut result = result.lock().clone();
    if result.is_final() {
        debug!(%cmd, "exit status arrived at the deadline");
        handle.outcome = Some(Outcome::Completed(result.clone()));
        return Ok(result);
    }
    warn!(%cmd, ?timeout, "command timed out, channel closed");
    result.mark_finished();
    handle.outcome = Some(Outcome::TimedOut(result.clone(), timeout));
    Err(Error::Timeout {
        result: Box::new(result),
        timeout,
    })
}

/// Waits briefly for a cancelled worker, aborting it if it hangs.
async fn stop(mut worker: JoinHandle<Result<()>>) {
    match tokio::time::timeout(CANCEL_GRACE, &mut worker).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => debug!(?error, "worker failed while stopping"),
        Ok(Err(error)) => warn!(?error, "worker panicked while stopping"),
        Err(_) => {
            warn!("worker did not stop in time, aborting");
            worker.abort();
        }
    }
}

/// Worker loop: appends output until the process ends or `done` fires.
async fn drain(
    mut process: Box<dyn Process>,
    result: Arc<Mutex<ExecResult>>,
    capture: Capture,
    done: CancellationToken,
) -> Result<()> {
    let mut exit_code = None;

    loop {
        let event = tokio::select! {
            biased;
            () = done.cancelled() => {
                if let Some(code) = exit_code {
                    result.lock().set_exit_code(code)?;
                }
                if let Err(error) = process.close().await {
                    warn!(?error, "unable to close channel after timeout");
                }
                return Ok(());
            }
            event = process.next_event() => event,
        };

        match event? {
            Some(ProcessEvent::Stdout(chunk)) if capture.stdout => {
                result.lock().push_stdout(&chunk)?;
            }
            Some(ProcessEvent::Stderr(chunk)) if capture.stderr => {
                result.lock().push_stderr(&chunk)?;
            }
            Some(ProcessEvent::Stdout(_) | ProcessEvent::Stderr(_)) => {}
            // Output may still follow the exit status.
            Some(ProcessEvent::Exit(code)) => exit_code = Some(code),
            None => break,
        }
    }

    // Completion is latched only if the supervisor has not given up.
    if !done.is_cancelled() {
        result
            .lock()
            .set_exit_code(exit_code.unwrap_or(ExitCode::INVALID))?;
    }
    if let Err(error) = process.close().await {
        debug!(?error, "unable to close finished channel");
    }
    Ok(())
}

// Tests ----------------------------------------------------------------------
