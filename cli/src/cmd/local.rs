use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use jumpexec::action::Exec;
use jumpexec::action::LocalExec;

use crate::args::ActionArgs;
use crate::cmd::output;
use crate::cmd::Run;

/// Run a command on this machine
#[derive(Debug, Args)]
pub struct LocalArgs {
    /// Command to run.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,

    #[clap(flatten)]
    action_args: ActionArgs,
}

impl Run for LocalArgs {
    async fn run(&self) -> Result<ExitCode> {
        anyhow::ensure!(
            !self.action_args.sudo,
            "--sudo needs a password and is only supported on remote hosts"
        );
        let local = LocalExec::builder()
            .maybe_log_mask(self.action_args.mask.clone())
            .build();
        let command = self.command.join(" ");

        let outcome = local
            .check_call(&command, &self.action_args.exec_options())
            .await;
        output::finish(outcome)
    }
}
