use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Args;
use jumpexec::action::client::SshOptions;
use jumpexec::auth::AuthMaterial;
use jumpexec::auth::AuthRegistry;
use jumpexec::resolve::HostsConfig;
use jumpexec::resolve::Overrides;
use jumpexec::util::secret::SecureString;

use crate::args::ActionArgs;

const HEADING: Option<&str> = Some("Authentication Options");

/// Credentials for the target host. Jump hosts use their own config.
#[derive(Debug, Args, Clone)]
pub struct AuthArgs {
    /// Remote user to authenticate as.
    #[arg(short = 'u', long, help_heading = HEADING)]
    pub user: Option<String>,

    /// Path to password file. The password is also fed to sudo.
    #[arg(long, help_heading = HEADING)]
    pub password_file: Option<Utf8PathBuf>,

    /// Path to SSH agent socket.
    #[arg(long, env = "SSH_AUTH_SOCK", help_heading = HEADING)]
    pub ssh_agent: Option<Utf8PathBuf>,

    /// Path to SSH private key.
    #[arg(long, help_heading = HEADING)]
    pub ssh_key: Option<Utf8PathBuf>,
}

impl AuthArgs {
    pub fn password(&self) -> Result<Option<SecureString>> {
        let Some(path) = &self.password_file else {
            return Ok(None);
        };
        let text = read_secret(path)?;
        Ok(Some(SecureString::from(text.expose().trim_end_matches(['\r', '\n']))))
    }

    pub fn keys(&self) -> Result<Vec<SecureString>> {
        self.ssh_key
            .iter()
            .map(|path| read_secret(path))
            .collect()
    }

    /// Agent credentials for every alias in `hosts`, so that jump hosts
    /// can use the agent too.
    pub fn registry(&self, hosts: &HostsConfig) -> Result<AuthRegistry> {
        let Some(agent) = &self.ssh_agent else {
            return Ok(AuthRegistry::default());
        };
        hosts
            .aliases()
            .map(|alias| {
                let config = hosts.resolve(alias, &Overrides::default())?;
                let auth = AuthMaterial::from_config(&config).with_agent(agent.as_std_path());
                Ok::<_, anyhow::Error>((alias.to_owned(), auth))
            })
            .collect()
    }

    pub fn ssh_options(
        &self,
        host: &str,
        hosts: &HostsConfig,
        action: &ActionArgs,
    ) -> Result<SshOptions> {
        let options = SshOptions::builder()
            .host(host)
            .maybe_username(self.user.clone())
            .maybe_password(self.password()?)
            .keys(self.keys()?)
            .maybe_agent(self.ssh_agent.clone().map(Utf8PathBuf::into_std_path_buf))
            .hosts(hosts.clone())
            .auth_registry(self.registry(hosts)?)
            .keepalive(action.keepalive.into())
            .maybe_log_mask(action.mask.clone())
            .sudo(action.sudo)
            .build();
        Ok(options)
    }
}

fn read_secret(path: &Utf8Path) -> Result<SecureString> {
    let text = std::fs::read_to_string(path).with_context(|| format!("unable to read {path}"))?;
    Ok(SecureString::from(text))
}

// Tests ----------------------------------------------------------------------
