//! [`Connector`] backed by russh.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use russh::client::Handle;
use russh::client::Msg;
use russh::keys::agent::client::AgentClient;
use russh::keys::agent::client::AgentStream;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::keys::PrivateKey;
use russh::keys::PublicKey;
use russh::AgentAuthError;
use russh::Channel;
use russh::ChannelMsg;
use russh::CryptoVec;
use russh::Disconnect;
use russh::Signer;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::proxy_command::ProxyCommandStream;
use super::tcp::TcpDialer;
use super::Connector;
use super::Dial;
use super::Session;
use super::TransportStream;
use crate::action::engine::Process;
use crate::action::engine::ProcessEvent;
use crate::action::engine::Spawned;
use crate::action::engine::Stdin;
use crate::action::result::ExitCode;
use crate::action::PtySize;
use crate::auth::AuthMaterial;
use crate::resolve::TargetKey;
use crate::Error;
use crate::Result;

// Connector ------------------------------------------------------------------

/// Connects over TCP, a proxy command or a tunnel, then authenticates.
///
/// Server host keys are accepted without verification.
#[derive(Clone)]
pub struct RusshConnector {
    tcp: TcpDialer,
    config: Arc<client::Config>,
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(TcpDialer::default())
    }
}

impl RusshConnector {
    #[must_use]
    pub fn new(tcp: TcpDialer) -> Self {
        let config = client::Config {
            // Keepalive is driven per session, see `RusshSession::set_keepalive`.
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            tcp,
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        target: &TargetKey,
        auth: &AuthMaterial,
        dial: Dial,
    ) -> Result<Arc<dyn Session>> {
        let config = Arc::clone(&self.config);
        let handler = SshClientHandler;
        let handshake = match dial {
            Dial::Direct => {
                let tcp = self.tcp.dial(target).await?;
                client::connect_stream(config, tcp, handler).await
            }
            Dial::ProxyCommand(command) => {
                let stream = ProxyCommandStream::spawn(&command)
                    .map_err(|error| Error::transport(target, error))?;
                client::connect_stream(config, stream, handler).await
            }
            Dial::Stream(stream) => client::connect_stream(config, stream, handler).await,
        };
        let mut handle = handshake.map_err(|error| Error::transport(target, error))?;
        debug!(%target, "ssh handshake done");

        authenticate(&mut handle, target, auth).await?;
        debug!(%target, user = %auth.username(), "ssh authentication succeeded");

        Ok(Arc::new(RusshSession {
            target: target.clone(),
            handle: Arc::new(handle),
            keepalive: Mutex::new(None),
        }))
    }
}

/// Offers agent identities, keys, the key file and the password, in that
/// order, stopping at the first one accepted.
async fn authenticate(
    handle: &mut Handle<SshClientHandler>,
    target: &TargetKey,
    auth: &AuthMaterial,
) -> Result<()> {
    let user = auth.username();
    let transport = |error: russh::Error| Error::transport(target, error);
    let rejected = |reason: String| Error::Authentication {
        target: target.clone(),
        user: user.to_owned(),
        reason,
    };
    let mut offered = Vec::new();

    if let Some(socket) = auth.agent() {
        offered.push("agent");
        match auth_agent(handle, user, socket).await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(%user, "no agent identity accepted"),
            Err(error) => warn!(?error, "ssh agent authentication failed"),
        }
    }

    for key in auth.keys() {
        offered.push("key");
        let key = russh::keys::decode_secret_key(key.expose(), None)
            .map_err(|error| rejected(format!("invalid private key: {error}")))?;
        if auth_key(handle, user, key).await.map_err(transport)? {
            return Ok(());
        }
    }

    if let Some(path) = auth.key_file() {
        offered.push("key file");
        let key = russh::keys::load_secret_key(path, None).map_err(|error| {
            rejected(format!("unable to load {}: {error}", path.display()))
        })?;
        if auth_key(handle, user, key).await.map_err(transport)? {
            return Ok(());
        }
    }

    if let Some(password) = auth.password() {
        offered.push("password");
        let result = handle
            .authenticate_password(user, password.expose())
            .await
            .map_err(transport)?;
        if result.success() {
            return Ok(());
        }
    }

    if offered.is_empty() {
        return Err(rejected("no credentials to offer".into()));
    }
    Err(rejected(format!("rejected {}", offered.join(", "))))
}

async fn auth_key(
    handle: &mut Handle<SshClientHandler>,
    user: &str,
    key: PrivateKey,
) -> Result<bool, russh::Error> {
    let hash = match key.algorithm() {
        ssh_key::Algorithm::Rsa { .. } => handle.best_supported_rsa_hash().await?.flatten(),
        _ => None,
    };
    let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
    let result = handle.authenticate_publickey(user, key).await?;
    Ok(result.success())
}

#[cfg(unix)]
async fn auth_agent(
    handle: &mut Handle<SshClientHandler>,
    user: &str,
    socket: &Path,
) -> anyhow::Result<bool> {
    let mut agent = AgentClient::connect_uds(socket).await?.dynamic();
    let identities = agent.request_identities().await?;

    for key in identities {
        let comment = key.comment().to_owned();
        let result = handle
            .authenticate_publickey_with(user, key, None, &mut AgentSigner { agent: &mut agent })
            .await;
        match result {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => debug!(%user, key = %comment, "ssh agent key denied"),
            Err(error) => warn!(?error, key = %comment, "ssh agent signing failed"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn auth_agent(
    _handle: &mut Handle<SshClientHandler>,
    _user: &str,
    _socket: &Path,
) -> anyhow::Result<bool> {
    anyhow::bail!("ssh agent sockets are only supported on unix")
}

/// Signs through the agent with an owned copy of the key, so the signing
/// future is `Send`.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

// Session --------------------------------------------------------------------

struct RusshSession {
    target: TargetKey,
    handle: Arc<Handle<SshClientHandler>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl RusshSession {
    fn channel_error(&self, error: russh::Error) -> Error {
        Error::channel(&self.target, error)
    }
}

#[async_trait]
impl Session for RusshSession {
    async fn open_exec(&self, command: &str, pty: Option<PtySize>) -> Result<Spawned> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|error| self.channel_error(error))?;
        if let Some(pty) = pty {
            channel
                .request_pty(false, "vt100", pty.width, pty.height, 0, 0, &[])
                .await
                .map_err(|error| self.channel_error(error))?;
        }
        channel
            .exec(true, command)
            .await
            .map_err(|error| self.channel_error(error))?;

        let stdin: Stdin = Box::new(channel.make_writer());
        Ok(Spawned {
            process: Box::new(RusshProcess {
                target: self.target.clone(),
                channel,
            }),
            stdin: Some(stdin),
        })
    }

    async fn open_tunnel(&self, host: &str, port: u16, origin: &str) -> Result<TransportStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), origin, 0)
            .await
            .map_err(|error| self.channel_error(error))?;
        debug!(target = %self.target, %host, port, "opened tunnel");
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_subsystem(&self, name: &str) -> Result<TransportStream> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|error| self.channel_error(error))?;
        channel
            .request_subsystem(true, name)
            .await
            .map_err(|error| self.channel_error(error))?;
        Ok(Box::new(channel.into_stream()))
    }

    fn set_keepalive(&self, period: Duration) {
        let mut task = self.keepalive.lock();
        if let Some(task) = task.take() {
            task.abort();
        }
        if period.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(target = %self.target, "no runtime to send keepalives on");
            return;
        };

        let handle = Arc::clone(&self.handle);
        let target = self.target.clone();
        *task = Some(runtime.spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(error) = handle.send_keepalive(false).await {
                    debug!(%target, ?error, "keepalive failed, stopping");
                    break;
                }
            }
        }));
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|error| self.channel_error(error))
    }
}

impl Drop for RusshSession {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.get_mut().take() {
            task.abort();
        }
    }
}

// Process --------------------------------------------------------------------

struct RusshProcess {
    target: TargetKey,
    channel: Channel<Msg>,
}

#[async_trait]
impl Process for RusshProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>> {
        loop {
            let Some(msg) = self.channel.wait().await else {
                return Ok(None);
            };
            match msg {
                ChannelMsg::Data { ref data } => {
                    return Ok(Some(ProcessEvent::Stdout(data.to_vec())));
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    return Ok(Some(ProcessEvent::Stderr(data.to_vec())));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Ok(Some(ProcessEvent::Exit(ExitCode::from(exit_status))));
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    debug!(target = %self.target, ?signal_name, "remote command killed by signal");
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.channel
            .close()
            .await
            .map_err(|error| Error::channel(&self.target, error))
    }
}
