use std::fmt;
use std::future::Future;
use std::iter;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use parking_lot::Mutex;
use regex::Regex;
use russh_sftp::client::fs::Metadata;
use russh_sftp::client::SftpSession;
use tokio::sync::OnceCell;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::action::engine::Capture;
use crate::action::engine::ExecHandle;
use crate::action::prepare::prepare;
use crate::action::result::ExecResult;
use crate::action::transport::proxy_command;
use crate::action::transport::Connector;
use crate::action::transport::Dial;
use crate::action::transport::RusshConnector;
use crate::action::transport::Session;
use crate::action::transport::TransportStream;
use crate::action::Exec;
use crate::action::ExecOptions;
use crate::auth::AuthMaterial;
use crate::auth::AuthRegistry;
use crate::resolve::ConnectionChain;
use crate::resolve::Hop;
use crate::resolve::HostsConfig;
use crate::resolve::Overrides;
use crate::resolve::TargetKey;
use crate::util::secret::SecureString;
use crate::Error;
use crate::Result;

/// Keepalive period used unless the caller asks otherwise.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(1);

// Retry ----------------------------------------------------------------------

/// How the outermost connection is retried.
///
/// Only [`Error::Transport`] is retried. Authentication and configuration
/// errors fail on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails for good, or attempts run out.
    ///
    /// # Errors
    ///
    /// The last error returned by `op`.
    pub async fn run<T, F, Fut>(&self, target: &TargetKey, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(error) if error.is_retryable() && attempt < attempts => {
                    warn!(
                        %target,
                        attempt,
                        ?error,
                        "connection failed, retrying in {}",
                        humantime::format_duration(self.delay)
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

// Options --------------------------------------------------------------------

fn default_connector() -> Arc<dyn Connector> {
    Arc::new(RusshConnector::default())
}

/// Everything needed to reach a remote host.
///
/// Credentials are chosen in this order: `auth`, then `username`,
/// `password` and `keys`, then the registry entry for the host, then the
/// host's own config.
#[derive(Builder)]
pub struct SshOptions {
    /// Alias or `[user@]host[:port]`.
    #[builder(into)]
    host: String,

    port: Option<u16>,

    #[builder(into)]
    username: Option<String>,

    #[builder(into)]
    password: Option<SecureString>,

    #[builder(default)]
    keys: Vec<SecureString>,

    /// SSH agent socket offered when credentials are built here rather
    /// than taken from `auth` or the registry.
    #[builder(into)]
    agent: Option<PathBuf>,

    auth: Option<AuthMaterial>,

    #[builder(default)]
    hosts: HostsConfig,

    #[builder(default)]
    auth_registry: AuthRegistry,

    /// Zero disables keepalive, and [`SshClient`] then closes the
    /// connection after every scoped use.
    #[builder(default = DEFAULT_KEEPALIVE)]
    keepalive: Duration,

    #[builder(into)]
    chroot: Option<String>,

    log_mask: Option<Regex>,

    #[builder(default)]
    retry: RetryPolicy,

    #[builder(default = default_connector())]
    connector: Arc<dyn Connector>,

    #[builder(default)]
    sudo: bool,

    /// Already open socket or channel to the target, used instead of the
    /// chain. It is consumed by the first connect, so a later
    /// [`SshClient::reconnect`] fails with [`Error::Config`].
    stream: Option<TransportStream>,

    #[builder(skip)]
    via: Option<Via>,
}

/// Parent session a proxied client tunnels its first hop through.
#[derive(Clone)]
struct Via {
    session: Arc<dyn Session>,
    origin: String,
}

// Client ---------------------------------------------------------------------

struct Connected {
    target: Arc<dyn Session>,
    /// Jump host sessions, outermost first.
    jumps: Vec<Arc<dyn Session>>,
    sftp: OnceCell<Arc<SftpSession>>,
}

impl Connected {
    fn sessions(&self) -> impl Iterator<Item = &Arc<dyn Session>> {
        self.jumps.iter().chain(iter::once(&self.target))
    }

    /// Closes innermost first so tunnels go away before what carries them.
    async fn close(&self) {
        if let Some(sftp) = self.sftp.get() {
            if let Err(error) = sftp.close().await {
                debug!(?error, "unable to close sftp session");
            }
        }
        for session in iter::once(&self.target).chain(self.jumps.iter().rev()) {
            if let Err(error) = session.close().await {
                warn!(?error, "unable to close session");
            }
        }
    }
}

/// Executor for a remote host, possibly reached through jump hosts.
pub struct SshClient {
    chain: ConnectionChain,
    hosts: HostsConfig,
    registry: AuthRegistry,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    via: Option<Via>,
    /// Caller supplied stream, `Some(None)` once consumed.
    stream: Option<Mutex<Option<TransportStream>>>,
    chroot: Option<String>,
    log_mask: Option<Regex>,
    /// Serializes connect, reconnect and close.
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<Option<Arc<Connected>>>,
    sudo: AtomicBool,
    keepalive: Mutex<Duration>,
}

impl fmt::Debug for SshClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshClient")
            .field("target", &self.target())
            .field("user", &self.auth().username())
            .field("hops", &self.chain.len())
            .field("sudo", &self.sudo_mode())
            .field("keepalive", &self.keepalive_period())
            .finish_non_exhaustive()
    }
}

impl SshClient {
    /// Resolves the target and its jump hosts, then connects.
    ///
    /// The credentials finally used are recorded in the registry under the
    /// resolved host name.
    ///
    /// # Errors
    ///
    /// - The host or one of its jumps cannot be resolved
    /// - Authentication fails on any hop
    /// - The outermost hop stays unreachable after every retry
    pub async fn connect(options: SshOptions) -> Result<Self> {
        let client = Self::new(options)?;
        client.reconnect().await?;
        Ok(client)
    }

    fn new(options: SshOptions) -> Result<Self> {
        let overrides = Overrides {
            port: options.port,
            user: options.username.clone(),
            identity_file: None,
        };
        let config = options.hosts.resolve(&options.host, &overrides)?;

        let explicit =
            options.username.is_some() || options.password.is_some() || !options.keys.is_empty();
        let known = options
            .auth_registry
            .get_with_alias(&options.host, &config.hostname);
        let auth = match (options.auth, known) {
            (Some(auth), _) => auth,
            (None, Some(known)) if !explicit => known.clone(),
            (None, _) => AuthMaterial::builder()
                .username(
                    config
                        .user
                        .clone()
                        .unwrap_or_else(whoami::username),
                )
                .maybe_password(options.password)
                .keys(options.keys)
                .maybe_key_file(config.identity_file.clone())
                .maybe_agent(options.agent)
                .build(),
        };

        let mut registry = options.auth_registry;
        registry.insert(config.hostname.clone(), auth.clone());
        let chain = ConnectionChain::build(config, auth, &options.hosts, &registry)?;

        Ok(Self {
            chain,
            hosts: options.hosts,
            registry,
            connector: options.connector,
            retry: options.retry,
            via: options.via,
            stream: options.stream.map(|stream| Mutex::new(Some(stream))),
            chroot: options.chroot,
            log_mask: options.log_mask,
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(None),
            sudo: AtomicBool::new(options.sudo),
            keepalive: Mutex::new(options.keepalive),
        })
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.chain.target().config.hostname
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.chain.target().config.port()
    }

    /// Credentials used for the target host.
    #[must_use]
    pub fn auth(&self) -> &AuthMaterial {
        &self.chain.target().auth
    }

    #[must_use]
    pub fn chain(&self) -> &ConnectionChain {
        &self.chain
    }

    #[must_use]
    pub fn auth_registry(&self) -> &AuthRegistry {
        &self.registry
    }

    // Lifecycle --------------------------------------------------------------

    /// Closes any current connection and opens the chain again.
    ///
    /// # Errors
    ///
    /// See [`SshClient::connect`].
    #[instrument(skip_all, fields(target = %self.target()))]
    pub async fn reconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.state.lock().take();
        if let Some(previous) = previous {
            previous.close().await;
        }

        let connected = self.open_chain().await?;
        let keepalive = self.keepalive_period();
        for session in connected.sessions() {
            session.set_keepalive(keepalive);
        }
        *self.state.lock() = Some(Arc::new(connected));
        info!(hops = self.chain.len(), user = %self.auth().username(), "connected");
        Ok(())
    }

    /// Closes the connection. Errors are logged, never returned.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.state.lock().take();
        if let Some(previous) = previous {
            previous.close().await;
            debug!(target = %self.target(), "closed");
        }
    }

    pub async fn is_alive(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        self.state
            .lock()
            .as_ref()
            .is_some_and(|connected| !connected.target.is_closed())
    }

    async fn open_chain(&self) -> Result<Connected> {
        if let Some(supplied) = &self.stream {
            return self.open_supplied(supplied).await;
        }

        let hops = self.chain.hops();
        let Some((first, rest)) = hops.split_first() else {
            return Err(Error::Config("empty connection chain".into()));
        };

        let key = first.config.key();
        let outermost = self.retry.run(&key, || self.dial_first(first)).await?;

        let mut sessions = vec![outermost];
        for hop in rest {
            let dialed = self.dial_through(sessions.last(), hop).await;
            match dialed {
                Ok(session) => sessions.push(session),
                Err(error) => {
                    for session in sessions.iter().rev() {
                        if let Err(error) = session.close().await {
                            debug!(?error, "unable to close partial chain");
                        }
                    }
                    return Err(error);
                }
            }
        }

        let target = sessions
            .pop()
            .ok_or_else(|| Error::Config("empty connection chain".into()))?;
        Ok(Connected {
            target,
            jumps: sessions,
            sftp: OnceCell::new(),
        })
    }

    /// Connects the target straight over the caller's stream, without
    /// jumps or retries.
    async fn open_supplied(&self, supplied: &Mutex<Option<TransportStream>>) -> Result<Connected> {
        let target = self.chain.target();
        let key = target.config.key();
        let stream = supplied.lock().take().ok_or_else(|| {
            Error::Config(format!("the stream supplied for {key} was already used"))
        })?;
        debug!(target = %key, "connecting over supplied stream");
        let session = self
            .connector
            .connect(&key, &target.auth, Dial::Stream(stream))
            .await?;
        Ok(Connected {
            target: session,
            jumps: Vec::new(),
            sftp: OnceCell::new(),
        })
    }

    async fn dial_first(&self, hop: &Hop) -> Result<Arc<dyn Session>> {
        let config = &hop.config;
        let dial = if let Some(via) = &self.via {
            let stream = via
                .session
                .open_tunnel(&config.hostname, config.port(), &via.origin)
                .await?;
            Dial::Stream(stream)
        } else if let Some(template) = &config.proxycommand {
            Dial::ProxyCommand(proxy_command::expand(
                template,
                &config.hostname,
                config.port(),
                hop.auth.username(),
            ))
        } else {
            Dial::Direct
        };
        debug!(target = %config.key(), ?dial, "dialing");
        self.connector.connect(&config.key(), &hop.auth, dial).await
    }

    async fn dial_through(
        &self,
        parent: Option<&Arc<dyn Session>>,
        hop: &Hop,
    ) -> Result<Arc<dyn Session>> {
        let config = &hop.config;
        let key = config.key();
        let parent = parent.ok_or_else(|| Error::NotConnected {
            target: key.clone(),
        })?;
        let origin = config.proxyjump.as_deref().unwrap_or_default();
        let stream = parent
            .open_tunnel(&config.hostname, config.port(), origin)
            .await?;
        debug!(target = %key, via = origin, "dialing through jump host");
        self.connector
            .connect(&key, &hop.auth, Dial::Stream(stream))
            .await
    }

    fn connected(&self) -> Result<Arc<Connected>> {
        self.state
            .lock()
            .clone()
            .ok_or_else(|| Error::NotConnected {
                target: self.target(),
            })
    }

    fn session(&self) -> Result<Arc<dyn Session>> {
        Ok(Arc::clone(&self.connected()?.target))
    }

    // Modes ------------------------------------------------------------------

    #[must_use]
    pub fn sudo_mode(&self) -> bool {
        self.sudo.load(Ordering::SeqCst)
    }

    pub fn set_sudo_mode(&self, enabled: bool) {
        self.sudo.store(enabled, Ordering::SeqCst);
    }

    /// Sets sudo mode until the guard is dropped.
    #[must_use]
    pub fn sudo(&self, enabled: bool) -> SudoGuard<'_> {
        let previous = self.sudo.swap(enabled, Ordering::SeqCst);
        SudoGuard {
            client: self,
            previous,
        }
    }

    /// Awaits `fut` with sudo mode set, restoring the previous mode
    /// afterwards, on error and on cancellation too.
    pub async fn with_sudo<T>(&self, enabled: bool, fut: impl Future<Output = T>) -> T {
        let _guard = self.sudo(enabled);
        fut.await
    }

    #[must_use]
    pub fn keepalive_period(&self) -> Duration {
        *self.keepalive.lock()
    }

    /// Changes the keepalive period, applying it to live sessions at once.
    pub fn set_keepalive_period(&self, period: Duration) {
        *self.keepalive.lock() = period;
        if let Some(connected) = self.state.lock().as_ref() {
            for session in connected.sessions() {
                session.set_keepalive(period);
            }
        }
    }

    /// Sets the keepalive period until the guard is dropped.
    #[must_use]
    pub fn keepalive(&self, period: Duration) -> KeepaliveGuard<'_> {
        let previous = self.keepalive_period();
        self.set_keepalive_period(period);
        KeepaliveGuard {
            client: self,
            previous,
        }
    }

    /// Awaits `fut` with the keepalive period set. When the period is zero
    /// the connection is closed afterwards.
    pub async fn with_keepalive<T>(&self, period: Duration, fut: impl Future<Output = T>) -> T {
        let guard = self.keepalive(period);
        let output = fut.await;
        drop(guard);
        if period.is_zero() {
            self.close().await;
        }
        output
    }

    // Relay ------------------------------------------------------------------

    /// Connects to another host through this connection.
    ///
    /// Hosts and credentials not given in `options` are inherited from this
    /// client.
    ///
    /// # Errors
    ///
    /// - This client is not connected
    /// - See [`SshClient::connect`]
    pub async fn proxy_to(&self, mut options: SshOptions) -> Result<SshClient> {
        if options.hosts.is_empty() {
            options.hosts = self.hosts.clone();
        }
        if options.auth_registry.is_empty() {
            options.auth_registry = self.registry.clone();
        }
        options.via = Some(Via {
            session: self.session()?,
            origin: self.hostname().to_owned(),
        });
        SshClient::connect(options).await
    }

    /// Runs `command` on `host` through this connection and closes the
    /// relayed connection afterwards, whatever the outcome.
    ///
    /// Without `auth` the credentials of this client are reused.
    ///
    /// # Errors
    ///
    /// - See [`SshClient::proxy_to`]
    /// - See [`Exec::execute`]
    pub async fn execute_through(
        &self,
        host: &str,
        command: &str,
        auth: Option<AuthMaterial>,
        port: Option<u16>,
        options: &ExecOptions,
    ) -> Result<ExecResult> {
        let relay = SshOptions::builder()
            .host(host)
            .maybe_port(port)
            .auth(auth.unwrap_or_else(|| self.auth().clone()))
            .keepalive(Duration::ZERO)
            .maybe_log_mask(self.log_mask.clone())
            .retry(self.retry)
            .connector(Arc::clone(&self.connector))
            .build();
        let relay = self.proxy_to(relay).await?;

        let outcome = relay.execute(command, options).await;
        relay.close().await;
        outcome
    }

    // Files ------------------------------------------------------------------

    /// SFTP session on the target, opened on first use.
    ///
    /// # Errors
    ///
    /// If not connected or the server refuses the subsystem.
    pub async fn sftp(&self) -> Result<Arc<SftpSession>> {
        let connected = self.connected()?;
        let sftp = connected
            .sftp
            .get_or_try_init(|| async {
                let stream = connected.target.open_subsystem("sftp").await?;
                let sftp = SftpSession::new(stream)
                    .await
                    .map_err(|source| Error::Sftp {
                        target: self.target(),
                        source: source.into(),
                    })?;
                debug!(target = %self.target(), "opened sftp session");
                Ok::<_, Error>(Arc::new(sftp))
            })
            .await?;
        Ok(Arc::clone(sftp))
    }

    async fn stat(&self, path: &str) -> Result<Option<Metadata>> {
        let sftp = self.sftp().await?;
        match sftp.metadata(path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(error) => {
                debug!(?error, path, "stat failed");
                Ok(None)
            }
        }
    }

    /// # Errors
    ///
    /// If no SFTP session can be opened.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// # Errors
    ///
    /// If no SFTP session can be opened.
    pub async fn is_file(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some_and(|m| m.is_regular()))
    }

    /// # Errors
    ///
    /// If no SFTP session can be opened.
    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some_and(|m| m.is_dir()))
    }
}

#[async_trait]
impl Exec for SshClient {
    fn target(&self) -> TargetKey {
        self.chain.target().config.key()
    }

    fn log_mask(&self) -> Option<&Regex> {
        self.log_mask.as_ref()
    }

    fn prepare_command(&self, command: &str, chroot: Option<&str>) -> String {
        prepare(
            command,
            self.sudo_mode(),
            chroot.or(self.chroot.as_deref()),
        )
    }

    async fn start(&self, command: &str, options: &ExecOptions) -> Result<ExecHandle> {
        let session = self.session()?;
        let sudo = self.sudo_mode();
        let prepared = prepare(
            command,
            sudo,
            options.chroot.as_deref().or(self.chroot.as_deref()),
        );

        let spawned = session.open_exec(&prepared, options.pty).await?;
        let capture = Capture {
            stdout: options.open_stdout,
            stderr: options.open_stderr,
        };
        let mut handle = ExecHandle::new(spawned, capture);

        if sudo {
            if let Some(stdin) = handle.stdin() {
                self.auth().enter_password(stdin).await?;
            }
        }
        if let Some(data) = &options.stdin {
            handle.write_stdin(data).await;
        }
        Ok(handle)
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        let Some(connected) = self.state.get_mut().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { connected.close().await });
            }
            Err(_) => debug!(target = %self.target(), "no runtime left to close connection"),
        }
    }
}

// Guards ---------------------------------------------------------------------

/// Restores the previous sudo mode on drop.
#[must_use]
pub struct SudoGuard<'a> {
    client: &'a SshClient,
    previous: bool,
}

impl Drop for SudoGuard<'_> {
    fn drop(&mut self) {
        self.client.set_sudo_mode(self.previous);
    }
}

/// Restores the previous keepalive period on drop.
#[must_use]
pub struct KeepaliveGuard<'a> {
    client: &'a SshClient,
    previous: Duration,
}

impl Drop for KeepaliveGuard<'_> {
    fn drop(&mut self) {
        self.client.set_keepalive_period(self.previous);
    }
}

// Tests ----------------------------------------------------------------------
