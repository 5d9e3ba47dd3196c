use std::collections::HashSet;

use crate::auth::AuthMaterial;
use crate::auth::AuthRegistry;
use crate::resolve::HostConfig;
use crate::resolve::HostsConfig;
use crate::resolve::Overrides;
use crate::resolve::TargetKey;
use crate::Error;
use crate::Result;

/// One host on the way to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub config: HostConfig,
    pub auth: AuthMaterial,
}

/// Ordered hops, outermost (directly dialable) first, target last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChain {
    hops: Vec<Hop>,
}

impl ConnectionChain {
    /// Chain of a host reached without any jump.
    #[must_use]
    pub fn direct(config: HostConfig, auth: AuthMaterial) -> Self {
        Self {
            hops: vec![Hop { config, auth }],
        }
    }

    /// Follows `proxyjump` links from `target` outward, then reverses them.
    ///
    /// Jump hosts take credentials from `registry` (alias first, then
    /// resolved host name) or fall back to their own config.
    ///
    /// # Errors
    ///
    /// - A jump alias cannot be resolved
    /// - The jumps form a cycle
    /// - A hop other than the outermost one has a `proxycommand`
    pub fn build(
        target: HostConfig,
        auth: AuthMaterial,
        hosts: &HostsConfig,
        registry: &AuthRegistry,
    ) -> Result<Self> {
        let mut seen: HashSet<TargetKey> = HashSet::from([target.key()]);
        let mut hops = vec![Hop {
            config: target,
            auth,
        }];

        while let Some(alias) = hops.last().and_then(|hop| hop.config.proxyjump.clone()) {
            let config = hosts.resolve(&alias, &Overrides::default())?;
            if !seen.insert(config.key()) {
                return Err(Error::Config(format!(
                    "proxy jump cycle through {}",
                    config.key()
                )));
            }
            let auth = registry
                .get_with_alias(&alias, &config.hostname)
                .cloned()
                .unwrap_or_else(|| AuthMaterial::from_config(&config));
            hops.push(Hop { config, auth });
        }
        hops.reverse();

        if let Some(hop) = hops
            .iter()
            .skip(1)
            .find(|hop| hop.config.proxycommand.is_some())
        {
            return Err(Error::Config(format!(
                "proxy command found after the first hop at {}",
                hop.config.key()
            )));
        }

        Ok(Self { hops })
    }

    #[must_use]
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// The final host commands run on.
    #[must_use]
    pub fn target(&self) -> &Hop {
        // Never empty: both constructors push the target.
        &self.hops[self.hops.len() - 1]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

// Tests ----------------------------------------------------------------------
