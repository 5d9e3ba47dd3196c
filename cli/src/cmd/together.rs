use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use jumpexec::action::run_together;
use jumpexec::action::SshClient;
use jumpexec::Error;
use tracing::error;
use tracing::instrument;

use crate::args::ActionArgs;
use crate::args::AuthArgs;
use crate::cmd::output;
use crate::cmd::output::Row;
use crate::cmd::Run;

/// Run a command on many hosts at once
#[derive(Debug, Args)]
pub struct TogetherArgs {
    /// Hosts to run on. Repeat or separate with commas.
    #[arg(short = 't', long = "target", value_delimiter = ',', required = true)]
    targets: Vec<String>,

    /// Command to run.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,

    #[clap(flatten)]
    auth_args: AuthArgs,

    #[clap(flatten)]
    action_args: ActionArgs,
}

impl Run for TogetherArgs {
    #[instrument(skip_all, fields(targets = self.targets.len()))]
    async fn run(&self) -> Result<ExitCode> {
        let hosts = self.action_args.hosts()?;
        let connects = self.targets.iter().map(|host| {
            let hosts = &hosts;
            async move {
                let options = self.auth_args.ssh_options(host, hosts, &self.action_args)?;
                SshClient::connect(options)
                    .await
                    .with_context(|| format!("unable to connect to {host}"))
            }
        });

        let mut clients = Vec::new();
        let mut unreachable = Vec::new();
        for (host, outcome) in self.targets.iter().zip(futures::future::join_all(connects).await) {
            match outcome {
                Ok(client) => clients.push(client),
                Err(error) => {
                    error!(%host, ?error, "skipping unreachable host");
                    unreachable.push(Row::exception(host, &format!("{error:#}")));
                }
            }
        }

        let command = self.command.join(" ");
        let outcome = run_together(&clients, &command, &self.action_args.exec_options()).await;
        for client in &clients {
            client.close().await;
        }

        let failed = !unreachable.is_empty();
        let (rows, succeeded) = match outcome {
            Ok(results) => (output::rows(&results, &Default::default()), true),
            Err(Error::ParallelExceptions(failure) | Error::ParallelProcess(failure)) => {
                error!(
                    errors = failure.errors.len(),
                    exceptions = failure.exceptions.len(),
                    "command failed on some hosts"
                );
                (output::rows(&failure.results, &failure.exceptions), false)
            }
            Err(error) => return Err(error.into()),
        };

        output::print_table(rows.into_iter().chain(unreachable).collect());
        if succeeded && !failed {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::FAILURE)
        }
    }
}
