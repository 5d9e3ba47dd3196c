use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use strum::Display;
use strum::FromRepr;

use crate::Error;
use crate::Result;

/// Lines kept from the start of a stream for its brief preview.
const BRIEF_HEAD: usize = 3;
/// Lines kept from the end of a stream for its brief preview.
const BRIEF_TAIL: usize = 3;
/// Longest line kept in a brief preview, in bytes.
const BRIEF_LINE_MAX: usize = 1024;

// Exit code ------------------------------------------------------------------

/// Process exit code. Well-known values print by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExitCode(i64);

impl ExitCode {
    /// No exit code could be obtained.
    pub const INVALID: Self = Self(0xDEAD_BEEF);
    pub const OK: Self = Self(0);
    pub const ERROR: Self = Self(1);
    pub const MISUSE: Self = Self(2);
    pub const CANNOT_EXECUTE: Self = Self(126);
    pub const NOT_FOUND: Self = Self(127);

    #[must_use]
    pub const fn new(code: i64) -> Self {
        Self(code)
    }

    /// Code a shell reports for a process killed by `signal`.
    #[must_use]
    pub fn from_signal(signal: i32) -> Self {
        Self(128 + i64::from(signal))
    }

    #[must_use]
    pub const fn code(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        Self(i64::from(code))
    }
}

impl From<u32> for ExitCode {
    fn from(code: u32) -> Self {
        Self(i64::from(code))
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match WellKnown::from_repr(self.0) {
            Some(name) => write!(f, "{name}<{}>", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Display, FromRepr)]
#[repr(i64)]
enum WellKnown {
    #[strum(serialize = "EX_INVALID")]
    Invalid = 0xDEAD_BEEF,
    #[strum(serialize = "EX_OK")]
    Ok = 0,
    #[strum(serialize = "EX_ERROR")]
    Error = 1,
    #[strum(serialize = "EX_BUILTIN")]
    Builtin = 2,
    #[strum(serialize = "EX_NOEXEC")]
    NoExec = 126,
    #[strum(serialize = "EX_NOCMD")]
    NoCmd = 127,
    #[strum(serialize = "EX_SIGHUP")]
    SigHup = 129,
    #[strum(serialize = "EX_SIGINT")]
    SigInt = 130,
    #[strum(serialize = "EX_SIGQUIT")]
    SigQuit = 131,
    #[strum(serialize = "EX_SIGABRT")]
    SigAbrt = 134,
    #[strum(serialize = "EX_SIGKILL")]
    SigKill = 137,
    #[strum(serialize = "EX_SIGSEGV")]
    SigSegv = 139,
    #[strum(serialize = "EX_SIGPIPE")]
    SigPipe = 141,
    #[strum(serialize = "EX_SIGTERM")]
    SigTerm = 143,
}

// Brief preview --------------------------------------------------------------

/// Bounded preview of a stream: its first and last few lines.
#[derive(Debug, Clone, Default)]
struct Brief {
    head: Vec<String>,
    tail: VecDeque<String>,
    lines: usize,
    partial: Vec<u8>,
}

impl Brief {
    fn push(&mut self, mut chunk: &[u8]) {
        while let Some(newline) = chunk.iter().position(|byte| *byte == b'\n') {
            self.extend_partial(&chunk[..newline]);
            self.finish_line();
            chunk = &chunk[newline + 1..];
        }
        self.extend_partial(chunk);
    }

    fn extend_partial(&mut self, bytes: &[u8]) {
        let room = BRIEF_LINE_MAX.saturating_sub(self.partial.len());
        self.partial.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn finish_line(&mut self) {
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        self.lines += 1;
        if self.head.len() < BRIEF_HEAD {
            self.head.push(line);
        } else {
            self.tail.push_back(line);
            // One spare line so that exactly head + tail + 1 lines print whole.
            if self.tail.len() > BRIEF_TAIL + 1 {
                self.tail.pop_front();
            }
        }
    }

    fn render(&self) -> String {
        let partial = (!self.partial.is_empty()).then(|| String::from_utf8_lossy(&self.partial));
        let total = self.lines + usize::from(partial.is_some());

        let rest: Vec<&str> = self
            .tail
            .iter()
            .map(String::as_str)
            .chain(partial.as_deref())
            .collect();

        let lines: Vec<&str> = if total <= BRIEF_HEAD + BRIEF_TAIL + 1 {
            self.head.iter().map(String::as_str).chain(rest).collect()
        } else {
            let skip = rest.len().saturating_sub(BRIEF_TAIL);
            self.head
                .iter()
                .map(String::as_str)
                .chain(std::iter::once("..."))
                .chain(rest.into_iter().skip(skip))
                .collect()
        };
        lines.join("\n").trim().to_owned()
    }
}

// Result ---------------------------------------------------------------------

/// Outcome of one command: output, exit code and timing.
///
/// Output may be appended until the exit code is recorded. After that the
/// result is final.
#[derive(Debug, Clone)]
pub struct ExecResult {
    cmd: String,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_brief: Brief,
    stderr_brief: Brief,
    exit_code: Option<ExitCode>,
    started: DateTime<Utc>,
    finished: Option<DateTime<Utc>>,
}

impl ExecResult {
    /// Empty result for `cmd`, started now. `cmd` should already be masked.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self::started_at(cmd, Utc::now())
    }

    pub fn started_at(cmd: impl Into<String>, started: DateTime<Utc>) -> Self {
        Self {
            cmd: cmd.into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_brief: Brief::default(),
            stderr_brief: Brief::default(),
            exit_code: None,
            started,
            finished: None,
        }
    }

    /// # Errors
    ///
    /// If the result is already final.
    pub fn push_stdout(&mut self, chunk: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.stdout.extend_from_slice(chunk);
        self.stdout_brief.push(chunk);
        Ok(())
    }

    /// # Errors
    ///
    /// If the result is already final.
    pub fn push_stderr(&mut self, chunk: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.stderr.extend_from_slice(chunk);
        self.stderr_brief.push(chunk);
        Ok(())
    }

    /// Records the exit code and end time, making the result final.
    ///
    /// # Errors
    ///
    /// If an exit code was already recorded.
    pub fn set_exit_code(&mut self, code: ExitCode) -> Result<()> {
        self.ensure_open()?;
        self.exit_code = Some(code);
        self.finished.get_or_insert_with(Utc::now);
        Ok(())
    }

    /// Stamps the end time without an exit code, e.g. after a timeout.
    pub fn mark_finished(&mut self) {
        self.finished.get_or_insert_with(Utc::now);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.exit_code.is_some() {
            return Err(Error::Finalized(self.cmd.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        self.exit_code.is_some()
    }

    #[must_use]
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.exit_code
    }

    #[must_use]
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    #[must_use]
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    #[must_use]
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    #[must_use]
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Standard output split into lines, without line endings.
    #[must_use]
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout_str().lines().map(str::to_owned).collect()
    }

    #[must_use]
    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_str().lines().map(str::to_owned).collect()
    }

    #[must_use]
    pub fn stdout_brief(&self) -> String {
        self.stdout_brief.render()
    }

    #[must_use]
    pub fn stderr_brief(&self) -> String {
        self.stderr_brief.render()
    }

    #[must_use]
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    #[must_use]
    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.finished
    }

    /// Wall-clock time between start and end, once ended.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.finished
            .and_then(|finished| (finished - self.started).to_std().ok())
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self
            .exit_code
            .map_or_else(|| "<unset>".to_owned(), |code| code.to_string());
        write!(
            f,
            "{:?}\n\tExit code: {code}\n\tSTDOUT:\n{}\n\tSTDERR:\n{}",
            self.cmd,
            self.stdout_brief(),
            self.stderr_brief()
        )
    }
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn numbered(count: usize) -> String {
        (1..=count).map(|i| format!("line{i}\n")).collect()
    }

    #[rstest]
    #[case::empty(0, "")]
    #[case::one(1, "line1")]
    #[case::seven(7, "line1\nline2\nline3\nline4\nline5\nline6\nline7")]
    #[case::eight(8, "line1\nline2\nline3\n...\nline6\nline7\nline8")]
    #[case::many(100, "line1\nline2\nline3\n...\nline98\nline99\nline100")]
    fn brief_keeps_head_and_tail(#[case] count: usize, #[case] expected: &str) {
        let mut result = ExecResult::new("seq");
        result.push_stdout(numbered(count).as_bytes()).unwrap();
        assert_eq!(result.stdout_brief(), expected);
    }

    #[test]
    fn brief_handles_split_lines() {
        let mut result = ExecResult::new("cat");
        for chunk in ["li", "ne1\nline", "2\nli", "ne3"] {
            result.push_stderr(chunk.as_bytes()).unwrap();
        }
        assert_eq!(result.stderr_brief(), "line1\nline2\nline3");
        assert_eq!(result.stderr_str(), "line1\nline2\nline3");
    }

    #[test]
    fn lines_drop_endings() {
        let mut result = ExecResult::new("printf");
        result.push_stdout(b"a\r\nb\n").unwrap();
        assert_eq!(result.stdout_lines(), ["a", "b"]);
        assert!(result.stderr_lines().is_empty());
    }

    #[test]
    fn brief_truncates_long_lines() {
        let mut result = ExecResult::new("yes");
        result.push_stdout(&vec![b'y'; BRIEF_LINE_MAX * 4]).unwrap();
        assert_eq!(result.stdout_brief().len(), BRIEF_LINE_MAX);
        assert_eq!(result.stdout().len(), BRIEF_LINE_MAX * 4);
    }

    #[test]
    fn exit_code_is_set_once() {
        let mut result = ExecResult::new("true");
        result.set_exit_code(ExitCode::OK).unwrap();
        assert!(result.is_final());
        assert!(result.finished().is_some());
        assert!(matches!(
            result.set_exit_code(ExitCode::ERROR),
            Err(Error::Finalized(_))
        ));
        assert_eq!(result.exit_code(), Some(ExitCode::OK));
    }

    #[test]
    fn output_after_exit_code_is_rejected() {
        let mut result = ExecResult::new("true");
        result.set_exit_code(ExitCode::OK).unwrap();
        assert!(result.push_stdout(b"late").is_err());
        assert!(result.stdout().is_empty());
    }

    #[test]
    fn mark_finished_keeps_exit_code_unset() {
        let mut result = ExecResult::new("sleep 10");
        result.mark_finished();
        assert!(result.exit_code().is_none());
        assert!(result.duration().is_some());
    }

    #[rstest]
    #[case::ok(ExitCode::OK, "EX_OK<0>")]
    #[case::not_found(ExitCode::NOT_FOUND, "EX_NOCMD<127>")]
    #[case::sigkill(ExitCode::from_signal(9), "EX_SIGKILL<137>")]
    #[case::invalid(ExitCode::INVALID, "EX_INVALID<3735928559>")]
    #[case::unknown(ExitCode::new(42), "42")]
    fn exit_code_display(#[case] code: ExitCode, #[case] expected: &str) {
        assert_eq!(code.to_string(), expected);
    }
}
