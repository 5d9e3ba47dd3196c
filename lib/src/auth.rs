//! Authentication material and its per-host registry.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use bon::Builder;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::resolve::HostConfig;
use crate::util::secret::SecureString;

/// Credentials for one host.
///
/// The transport offers them in the order: agent, in-memory keys, key file,
/// password.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct AuthMaterial {
    #[builder(into)]
    username: String,

    #[builder(into)]
    password: Option<SecureString>,

    /// Private keys in OpenSSH or PEM text form.
    #[builder(default)]
    keys: Vec<SecureString>,

    #[builder(into)]
    key_file: Option<PathBuf>,

    /// SSH agent socket.
    #[builder(into)]
    agent: Option<PathBuf>,
}

impl AuthMaterial {
    /// Default credentials derived from a host's own config: its user (or
    /// the local user) and its identity file.
    #[must_use]
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            username: config.user.clone().unwrap_or_else(whoami::username),
            password: None,
            keys: Vec::new(),
            key_file: config.identity_file.clone(),
            agent: None,
        }
    }

    /// Offers the identities of the agent behind `socket` first.
    #[must_use]
    pub fn with_agent(mut self, socket: impl Into<PathBuf>) -> Self {
        self.agent = Some(socket.into());
        self
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> Option<&SecureString> {
        self.password.as_ref()
    }

    #[must_use]
    pub fn keys(&self) -> &[SecureString] {
        &self.keys
    }

    #[must_use]
    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    #[must_use]
    pub fn agent(&self) -> Option<&Path> {
        self.agent.as_deref()
    }

    /// Writes the password followed by a newline, as `sudo -S` expects it.
    ///
    /// # Errors
    ///
    /// If writing to or flushing `stdin` fails.
    pub async fn enter_password<W>(&self, stdin: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let Some(password) = &self.password else {
            debug!(user = %self.username, "no password to enter");
            return Ok(());
        };
        let mut line = zeroize::Zeroizing::new(password.expose().as_bytes().to_vec());
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await
    }
}

/// Mapping from resolved host name to credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRegistry {
    entries: HashMap<String, AuthMaterial>,
}

impl AuthRegistry {
    pub fn insert(&mut self, hostname: impl Into<String>, auth: AuthMaterial) {
        self.entries.insert(hostname.into(), auth);
    }

    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<&AuthMaterial> {
        self.entries.get(hostname)
    }

    /// Looks up `alias`, falling back to its resolved `hostname`.
    ///
    /// A lookup by host name never falls back to an alias.
    #[must_use]
    pub fn get_with_alias(&self, alias: &str, hostname: &str) -> Option<&AuthMaterial> {
        self.entries
            .get(alias)
            .or_else(|| self.entries.get(hostname))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, AuthMaterial)> for AuthRegistry {
    fn from_iter<T: IntoIterator<Item = (String, AuthMaterial)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(user: &str) -> AuthMaterial {
        AuthMaterial::builder().username(user).build()
    }

    #[test]
    fn alias_falls_back_to_hostname() {
        let mut registry = AuthRegistry::default();
        registry.insert("db1.internal", auth("by-hostname"));

        let found = registry.get_with_alias("db1", "db1.internal").unwrap();
        assert_eq!(found.username(), "by-hostname");
    }

    #[test]
    fn alias_wins_over_hostname() {
        let registry: AuthRegistry = [
            ("db1".to_owned(), auth("by-alias")),
            ("db1.internal".to_owned(), auth("by-hostname")),
        ]
        .into_iter()
        .collect();

        let found = registry.get_with_alias("db1", "db1.internal").unwrap();
        assert_eq!(found.username(), "by-alias");
    }

    #[test]
    fn hostname_never_falls_back_to_alias() {
        let mut registry = AuthRegistry::default();
        registry.insert("db1", auth("by-alias"));

        assert!(registry.get("db1.internal").is_none());
    }

    #[test]
    fn default_from_config() {
        let config = HostConfig {
            user: Some("deploy".into()),
            identity_file: Some("/keys/id_ed25519".into()),
            ..HostConfig::new("web")
        };
        let auth = AuthMaterial::from_config(&config);
        assert_eq!(auth.username(), "deploy");
        assert_eq!(auth.key_file(), Some(Path::new("/keys/id_ed25519")));
        assert!(auth.password().is_none());
    }

    #[tokio::test]
    async fn enter_password_appends_newline() {
        let auth = AuthMaterial::builder()
            .username("root")
            .password("s3cret")
            .build();
        let mut stdin = Vec::new();
        auth.enter_password(&mut stdin).await.unwrap();
        assert_eq!(stdin, b"s3cret\n");
    }

    #[test]
    fn debug_hides_password() {
        let auth = AuthMaterial::builder()
            .username("root")
            .password("s3cret")
            .build();
        assert!(!format!("{auth:?}").contains("s3cret"));
    }
}
