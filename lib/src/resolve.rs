//! Resolution of host aliases into connection parameters.

pub mod chain;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use bon::Builder;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

pub use chain::ConnectionChain;
pub use chain::Hop;

/// Port used when neither an override nor the config names one.
pub const DEFAULT_PORT: u16 = 22;

/// Identity of an execution target: the resolved host and port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey {
    pub host: String,
    pub port: u16,
}

impl TargetKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Key used by executors running on this machine.
    #[must_use]
    pub fn local() -> Self {
        Self::new("localhost", 0)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connection parameters of one host, named after their ssh_config keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Real host name to dial. Empty in a hosts table means "the alias".
    pub hostname: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    #[serde(rename = "identityfile")]
    pub identity_file: Option<PathBuf>,
    /// Alias of the host this one is reached through.
    pub proxyjump: Option<String>,
    /// Shell command whose stdin/stdout carry the transport.
    pub proxycommand: Option<String>,
}

impl HostConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Parses `[user@]host[:port]`, with IPv6 hosts in brackets.
    ///
    /// # Errors
    ///
    /// If the host is empty or the port is not a valid number.
    pub fn from_destination(destination: &str) -> Result<Self> {
        let (user, rest) = match destination.rsplit_once('@') {
            Some((user, rest)) => (Some(user.to_owned()), rest),
            None => (None, destination),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("unterminated IPv6 host: {destination}")))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(parse_port(port, destination)?),
                None if after.is_empty() => None,
                None => return Err(Error::Config(format!("bad destination: {destination}"))),
            };
            (host, port)
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            (host, Some(parse_port(port, destination)?))
        } else {
            (rest, None)
        };

        if host.is_empty() {
            return Err(Error::Config(format!("missing host in {destination:?}")));
        }

        Ok(Self {
            hostname: host.to_owned(),
            port,
            user,
            ..Self::default()
        })
    }

    /// Port to dial, falling back to [`DEFAULT_PORT`].
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    #[must_use]
    pub fn key(&self) -> TargetKey {
        TargetKey::new(&self.hostname, self.port())
    }

    /// Returns a copy where every value set in `overrides` wins.
    #[must_use]
    pub fn overridden_by(&self, overrides: &Overrides) -> Self {
        let mut merged = self.clone();
        if let Some(port) = overrides.port {
            merged.port = Some(port);
        }
        if let Some(user) = &overrides.user {
            merged.user = Some(user.clone());
        }
        if let Some(identity_file) = &overrides.identity_file {
            merged.identity_file = Some(identity_file.clone());
        }
        merged
    }
}

fn parse_port(port: &str, destination: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::Config(format!("invalid port in {destination:?}")))
}

/// Explicit per-call values that beat anything parsed from config.
#[derive(Debug, Clone, Default, Builder)]
pub struct Overrides {
    pub port: Option<u16>,
    #[builder(into)]
    pub user: Option<String>,
    #[builder(into)]
    pub identity_file: Option<PathBuf>,
}

/// Pre-parsed table of host aliases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostsConfig(BTreeMap<String, HostConfig>);

impl HostsConfig {
    pub fn insert(&mut self, alias: impl Into<String>, config: HostConfig) {
        self.0.insert(alias.into(), config);
    }

    #[must_use]
    pub fn contains(&self, alias: &str) -> bool {
        self.0.contains_key(alias)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Resolves `alias` and merges `overrides` on top.
    ///
    /// Aliases missing from the table are parsed as `[user@]host[:port]`.
    ///
    /// # Errors
    ///
    /// If an unknown alias is not a valid destination.
    pub fn resolve(&self, alias: &str, overrides: &Overrides) -> Result<HostConfig> {
        let config = match self.0.get(alias) {
            Some(config) if config.hostname.is_empty() => HostConfig {
                hostname: alias.to_owned(),
                ..config.clone()
            },
            Some(config) => config.clone(),
            None => HostConfig::from_destination(alias)?,
        };
        Ok(config.overridden_by(overrides))
    }
}

impl FromIterator<(String, HostConfig)> for HostsConfig {
    fn from_iter<T: IntoIterator<Item = (String, HostConfig)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::bare("db1", None, "db1", None)]
    #[case::user("root@db1", Some("root"), "db1", None)]
    #[case::port("db1:2222", None, "db1", Some(2222))]
    #[case::full("admin@10.0.0.1:22", Some("admin"), "10.0.0.1", Some(22))]
    #[case::ipv6("[::1]:2200", None, "::1", Some(2200))]
    #[case::ipv6_no_port("[fe80::1]", None, "fe80::1", None)]
    #[case::ipv6_bare("fe80::1", None, "fe80::1", None)]
    fn parse_destination(
        #[case] input: &str,
        #[case] user: Option<&str>,
        #[case] host: &str,
        #[case] port: Option<u16>,
    ) {
        let config = HostConfig::from_destination(input).unwrap();
        assert_eq!(config.user.as_deref(), user);
        assert_eq!(config.hostname, host);
        assert_eq!(config.port, port);
    }

    #[rstest]
    #[case::empty("")]
    #[case::bad_port("db1:ssh")]
    #[case::unterminated("[::1:22")]
    fn parse_destination_rejects(#[case] input: &str) {
        assert!(matches!(
            HostConfig::from_destination(input),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn explicit_values_beat_table() {
        let mut hosts = HostsConfig::default();
        hosts.insert(
            "web",
            HostConfig {
                hostname: "web.internal".into(),
                port: Some(2022),
                user: Some("deploy".into()),
                ..HostConfig::default()
            },
        );

        let plain = hosts.resolve("web", &Overrides::default()).unwrap();
        assert_eq!(plain.key(), TargetKey::new("web.internal", 2022));
        assert_eq!(plain.user.as_deref(), Some("deploy"));

        let overrides = Overrides::builder().port(22).user("root").build();
        let merged = hosts.resolve("web", &overrides).unwrap();
        assert_eq!(merged.port(), 22);
        assert_eq!(merged.user.as_deref(), Some("root"));
        assert_eq!(merged.hostname, "web.internal");
    }

    #[test]
    fn default_port_and_hostname() {
        let hosts: HostsConfig =
            serde_json::from_str(r#"{"bastion": {"user": "jump"}}"#).unwrap();
        let config = hosts.resolve("bastion", &Overrides::default()).unwrap();
        assert_eq!(config.hostname, "bastion");
        assert_eq!(config.port(), DEFAULT_PORT);
    }

    #[rstest]
    #[case::plain(TargetKey::new("db1", 22), "db1:22")]
    #[case::ipv6(TargetKey::new("::1", 2222), "[::1]:2222")]
    fn display_key(#[case] key: TargetKey, #[case] expected: &str) {
        assert_eq!(key.to_string(), expected);
    }
}
