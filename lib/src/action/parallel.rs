//! One command on many targets under a shared deadline.

use std::collections::BTreeMap;
use std::collections::HashSet;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::debug;
use tracing::debug_span;
use tracing::info;
use tracing::warn;
use tracing::Instrument;

use crate::action::result::ExecResult;
use crate::action::Exec;
use crate::action::ExecOptions;
use crate::error::ParallelFailure;
use crate::resolve::TargetKey;
use crate::util::mask::mask_all;
use crate::Error;
use crate::Result;

/// Runs `command` on every distinct target concurrently.
///
/// `options.timeout` is one deadline shared by all targets. Targets still
/// running when it passes are cancelled, their channels closed, and they
/// appear in none of the returned maps.
///
/// # Errors
///
/// - [`Error::ParallelExceptions`] if any target failed to run the command,
///   whatever the exit codes of the others
/// - [`Error::ParallelProcess`] if any exit code is outside
///   `options.expected` and `options.raise_on_err` is set
pub async fn run_together<'a, E>(
    targets: impl IntoIterator<Item = &'a E>,
    command: &str,
    options: &ExecOptions,
) -> Result<BTreeMap<TargetKey, ExecResult>>
where
    E: Exec + ?Sized + 'a,
{
    let mut seen = HashSet::new();
    let targets: Vec<&E> = targets
        .into_iter()
        .filter(|exec| seen.insert(exec.target()))
        .collect();

    // Every target's own mask applies, as on the single-target path.
    let masks = targets.iter().filter_map(|exec| exec.log_mask());
    let cmd = mask_all(command, masks.chain(options.mask.as_ref()));
    if options.verbose {
        info!(targets = targets.len(), "Executing command in parallel:\n{cmd:?}");
    } else {
        debug!(targets = targets.len(), "Executing command in parallel:\n{cmd:?}");
    }

    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let unbounded = ExecOptions {
        timeout: None,
        ..options.clone()
    };
    let unbounded = &unbounded;
    let mut pending: FuturesUnordered<_> = targets
        .iter()
        .map(|exec| {
            let target = exec.target();
            let span = debug_span!("together", %target);
            async move { (target, exec.execute(command, unbounded).await) }.instrument(span)
        })
        .collect();

    let mut results = BTreeMap::new();
    let mut errors = BTreeMap::new();
    let mut exceptions = BTreeMap::new();

    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(cancelled = pending.len(), "deadline reached, cancelling remaining targets");
                    break;
                }
            },
            None => pending.next().await,
        };
        let Some((target, outcome)) = next else {
            break;
        };

        match outcome {
            Ok(result) => {
                if !options.expected.contains(result.exit_code()) {
                    errors.insert(target.clone(), result.clone());
                }
                results.insert(target, result);
            }
            Err(error) => {
                debug!(%target, ?error, "execution failed");
                exceptions.insert(target, error);
            }
        }
    }
    // Dropping the remaining executions closes their channels.
    drop(pending);

    let raise_exceptions = !exceptions.is_empty();
    let raise_process = options.raise_on_err && !errors.is_empty();
    if !(raise_exceptions || raise_process) {
        return Ok(results);
    }

    let failure = Box::new(ParallelFailure {
        command: cmd,
        results,
        errors,
        exceptions,
        expected: options.expected.clone(),
    });
    if raise_exceptions {
        Err(Error::ParallelExceptions(failure))
    } else {
        Err(Error::ParallelProcess(failure))
    }
}

// Tests ----------------------------------------------------------------------
