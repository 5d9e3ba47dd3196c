use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use jumpexec::action::Exec;
use jumpexec::action::SshClient;
use tracing::instrument;

use crate::args::ActionArgs;
use crate::args::AuthArgs;
use crate::cmd::output;
use crate::cmd::Run;

/// Run a command on one host
#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Host alias or `[user@]host[:port]`.
    host: String,

    /// Command to run.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,

    #[clap(flatten)]
    auth_args: AuthArgs,

    #[clap(flatten)]
    action_args: ActionArgs,
}

impl Run for ExecArgs {
    #[instrument(skip_all, fields(host = %self.host))]
    async fn run(&self) -> Result<ExitCode> {
        let hosts = self.action_args.hosts()?;
        let options = self
            .auth_args
            .ssh_options(&self.host, &hosts, &self.action_args)?;
        let client = SshClient::connect(options).await?;

        let command = self.command.join(" ");
        let outcome = client
            .check_call(&command, &self.action_args.exec_options())
            .await;
        client.close().await;

        output::finish(outcome)
    }
}
