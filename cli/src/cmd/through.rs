use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use jumpexec::action::SshClient;
use tracing::instrument;

use crate::args::ActionArgs;
use crate::args::AuthArgs;
use crate::cmd::output;
use crate::cmd::Run;

/// Run a command on a host reached through another one
#[derive(Debug, Args)]
pub struct ThroughArgs {
    /// Host to relay through.
    jump: String,

    /// Host to run the command on, as seen from the relay.
    target: String,

    /// Command to run.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,

    /// SSH port of the target.
    #[arg(long)]
    target_port: Option<u16>,

    #[clap(flatten)]
    auth_args: AuthArgs,

    #[clap(flatten)]
    action_args: ActionArgs,
}

impl Run for ThroughArgs {
    #[instrument(skip_all, fields(jump = %self.jump, target = %self.target))]
    async fn run(&self) -> Result<ExitCode> {
        let hosts = self.action_args.hosts()?;
        let options = self
            .auth_args
            .ssh_options(&self.jump, &hosts, &self.action_args)?;
        let jump = SshClient::connect(options).await?;

        // Agent credentials registered for the target alias, else the relay's.
        let auth = jump.auth_registry().get(&self.target).cloned();
        let exec_options = self.action_args.exec_options();
        let command = self.command.join(" ");
        let outcome = jump
            .execute_through(
                &self.target,
                &command,
                auth,
                self.target_port,
                &exec_options,
            )
            .await
            .and_then(|result| {
                exec_options
                    .expected
                    .check(result, exec_options.raise_on_err)
            });
        jump.close().await;

        output::finish(outcome)
    }
}
