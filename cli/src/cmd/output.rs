//! Printing results and turning them into a process exit code.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::ExitCode;

use anyhow::Result;
use jumpexec::action::result::ExecResult;
use jumpexec::resolve::TargetKey;
use jumpexec::Error;
use tabled::settings::Style;
use tabled::Table;
use tabled::Tabled;
use tracing::error;

/// Prints a single command's output and maps its exit code.
///
/// Unexpected exit codes are reported but still end in the command's own
/// code. Timeouts print what was captured before failing.
pub fn finish(outcome: jumpexec::Result<ExecResult>) -> Result<ExitCode> {
    match outcome {
        Ok(result) => {
            print_streams(&result)?;
            Ok(exit_code(&result))
        }
        Err(Error::CalledProcess { result, expected }) => {
            print_streams(&result)?;
            error!(exit_code = ?result.exit_code(), %expected, "command returned an unexpected exit code");
            Ok(exit_code(&result))
        }
        Err(error @ Error::Timeout { .. }) => {
            if let Some(result) = error.result() {
                print_streams(result)?;
            }
            Err(error.into())
        }
        Err(error) => Err(error.into()),
    }
}

fn print_streams(result: &ExecResult) -> Result<()> {
    std::io::stdout().write_all(result.stdout())?;
    std::io::stderr().write_all(result.stderr())?;
    Ok(())
}

fn exit_code(result: &ExecResult) -> ExitCode {
    result
        .exit_code()
        .and_then(|code| u8::try_from(code.code()).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from)
}

/// One line of the summary printed after a parallel run.
#[derive(Debug, Tabled)]
pub struct Row {
    target: String,
    #[tabled(rename = "exit code")]
    exit_code: String,
    stdout: String,
    stderr: String,
}

impl Row {
    pub fn result(target: &TargetKey, result: &ExecResult) -> Self {
        Self {
            target: target.to_string(),
            exit_code: result
                .exit_code()
                .map_or_else(|| "-".to_owned(), |code| code.to_string()),
            stdout: result.stdout_brief(),
            stderr: result.stderr_brief(),
        }
    }

    pub fn exception(target: impl ToString, error: &dyn std::fmt::Display) -> Self {
        Self {
            target: target.to_string(),
            exit_code: "-".to_owned(),
            stdout: String::new(),
            stderr: error.to_string(),
        }
    }
}

/// Rows for every result, then every exception, each sorted by target.
pub fn rows(
    results: &BTreeMap<TargetKey, ExecResult>,
    exceptions: &BTreeMap<TargetKey, Error>,
) -> Vec<Row> {
    results
        .iter()
        .map(|(target, result)| Row::result(target, result))
        .chain(
            exceptions
                .iter()
                .map(|(target, error)| Row::exception(target, error)),
        )
        .collect()
}

pub fn print_table(rows: Vec<Row>) {
    if rows.is_empty() {
        return;
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use jumpexec::action::result::ExitCode as Code;
    use rstest::rstest;

    use super::*;

    fn finished(code: Code) -> ExecResult {
        let mut result = ExecResult::new("true");
        result.push_stdout(b"line\n").unwrap();
        result.set_exit_code(code).unwrap();
        result
    }

    #[rstest]
    #[case::ok(Code::OK, ExitCode::SUCCESS)]
    #[case::misuse(Code::MISUSE, ExitCode::from(2))]
    #[case::invalid(Code::INVALID, ExitCode::FAILURE)]
    fn exit_code_follows_the_command(#[case] code: Code, #[case] expected: ExitCode) {
        let exit = finish(Ok(finished(code))).unwrap();
        assert_eq!(format!("{exit:?}"), format!("{expected:?}"));
    }

    #[test]
    fn rows_list_results_before_exceptions() {
        let results = BTreeMap::from([(TargetKey::new("b", 22), finished(Code::OK))]);
        let exceptions = BTreeMap::from([(
            TargetKey::new("a", 22),
            Error::NotConnected {
                target: TargetKey::new("a", 22),
            },
        )]);

        let rows = rows(&results, &exceptions);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].exit_code, "EX_OK<0>");
        assert_eq!(rows[1].stderr, "a:22 is not connected");
    }
}
