mod exec;
mod local;
mod output;
mod through;
mod together;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use enum_dispatch::enum_dispatch;

use crate::args::GlobalArgs;

/// Run commands on remote hosts through SSH jump chains
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    global_args: GlobalArgs,
}

/// Subcommands must implement [`Run`] to be executed at runtime.
#[enum_dispatch]
pub trait Run {
    async fn run(&self) -> Result<ExitCode>;
}

#[enum_dispatch(Run)]
#[derive(Debug, Subcommand)]
enum Command {
    Exec(exec::ExecArgs),
    Together(together::TogetherArgs),
    Through(through::ThroughArgs),
    Local(local::LocalArgs),
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = cli.global_args.init_tracing()?;

    cli.command.run().await
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case::exec(&["jumpexec", "exec", "db", "uname", "-a"])]
    #[case::together(&["jumpexec", "together", "-t", "a,b", "-t", "c", "uptime"])]
    #[case::through(&["jumpexec", "through", "bastion", "db", "--target-port", "2222", "id"])]
    #[case::local(&["jumpexec", "local", "--chroot", "/srv/root", "id"])]
    fn parses(#[case] argv: &[&str]) {
        Cli::try_parse_from(argv).unwrap();
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["jumpexec", "exec", "db"]).is_err());
    }
}
