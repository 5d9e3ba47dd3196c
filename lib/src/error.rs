use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::action::result::ExecResult;
use crate::action::ExpectedCodes;
use crate::resolve::TargetKey;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between resolving a host and reading a
/// command's result.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed host configuration or connection chain. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Server rejected every credential offered. Never retried.
    #[error("authentication failed for {user}@{target}: {reason}")]
    Authentication {
        target: TargetKey,
        user: String,
        reason: String,
    },

    /// Protocol or network level failure while opening a transport.
    #[error("unable to connect to {target}")]
    Transport {
        target: TargetKey,
        #[source]
        source: anyhow::Error,
    },

    /// Failure on an already established transport (opening a channel,
    /// requesting a subsystem, ...).
    #[error("channel failure on {target}")]
    Channel {
        target: TargetKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("{target} is not connected")]
    NotConnected { target: TargetKey },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Mutation of a result whose exit code is already recorded.
    #[error("result of {0:?} is already final")]
    Finalized(String),

    #[error("sftp failure on {target}: {source}")]
    Sftp {
        target: TargetKey,
        #[source]
        source: anyhow::Error,
    },

    /// The command did not return before its deadline. The channel has been
    /// closed and `result` holds whatever was captured up to that point.
    #[error(
        "Wait for {:?} during {}: no return code!\n\tSTDOUT:\n{}\n\tSTDERR:\n{}",
        .result.cmd(),
        humantime::format_duration(*.timeout),
        .result.stdout_brief(),
        .result.stderr_brief()
    )]
    Timeout {
        result: Box<ExecResult>,
        timeout: Duration,
    },

    /// The command returned an exit code outside of the expected set.
    #[error(
        "Command {:?} returned exit code {} while expected {}\n\tSTDOUT:\n{}\n\tSTDERR:\n{}",
        .result.cmd(),
        .result.exit_code().map_or_else(|| "<unset>".to_owned(), |code| code.to_string()),
        .expected,
        .result.stdout_brief(),
        .result.stderr_brief()
    )]
    CalledProcess {
        result: Box<ExecResult>,
        expected: ExpectedCodes,
    },

    /// At least one parallel target raised instead of returning a result.
    #[error("Command {:?} raised exceptions on {}", .0.command, TargetList(.0.exceptions.keys()))]
    ParallelExceptions(Box<ParallelFailure>),

    /// Every parallel target returned, but some with unexpected exit codes.
    #[error(
        "Command {:?} returned unexpected exit codes on {} while expected {}",
        .0.command,
        TargetList(.0.errors.keys()),
        .0.expected
    )]
    ParallelProcess(Box<ParallelFailure>),
}

impl Error {
    /// Whether the connection establisher may try again after this error.
    ///
    /// Only transport level failures qualify. Authentication failures are
    /// raised by the same transport but must surface immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub(crate) fn transport(target: &TargetKey, source: impl Into<anyhow::Error>) -> Self {
        Self::Transport {
            target: target.clone(),
            source: source.into(),
        }
    }

    pub(crate) fn channel(target: &TargetKey, source: impl Into<anyhow::Error>) -> Self {
        Self::Channel {
            target: target.clone(),
            source: source.into(),
        }
    }

    /// Partial or final result attached to this error, if any.
    #[must_use]
    pub fn result(&self) -> Option<&ExecResult> {
        match self {
            Self::Timeout { result, .. } | Self::CalledProcess { result, .. } => {
                Some(result.as_ref())
            }
            _ => None,
        }
    }
}

/// Per-target breakdown carried by both aggregate parallel errors.
#[derive(Debug)]
pub struct ParallelFailure {
    pub command: String,
    pub results: BTreeMap<TargetKey, ExecResult>,
    pub errors: BTreeMap<TargetKey, ExecResult>,
    pub exceptions: BTreeMap<TargetKey, Error>,
    pub expected: ExpectedCodes,
}

struct TargetList<I>(I);

impl<'a, I> fmt::Display for TargetList<I>
where
    I: Iterator<Item = &'a TargetKey> + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for target in self.0.clone() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{target}")?;
            first = false;
        }
        Ok(())
    }
}

// Tests ----------------------------------------------------------------------
