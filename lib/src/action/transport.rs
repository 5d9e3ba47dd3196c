//! Seam between the executors and the SSH protocol implementation.

#[cfg(test)]
pub(crate) mod mock;
pub mod proxy_command;
pub mod ssh;
pub mod tcp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::action::engine::Spawned;
use crate::action::PtySize;
use crate::auth::AuthMaterial;
use crate::resolve::TargetKey;
use crate::Result;

pub use ssh::RusshConnector;

/// Bidirectional byte stream a transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type TransportStream = Box<dyn AsyncStream>;

/// How the socket under a new session is obtained.
pub enum Dial {
    /// Plain TCP to the target.
    Direct,
    /// Spawn this shell command and speak over its stdin/stdout.
    ProxyCommand(String),
    /// Already open stream, usually a tunnel through a previous hop.
    Stream(TransportStream),
}

impl fmt::Debug for Dial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("Direct"),
            Self::ProxyCommand(command) => f.debug_tuple("ProxyCommand").field(command).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Opens authenticated sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Performs the handshake with `target` over `dial` and authenticates.
    ///
    /// Must fail with [`crate::Error::Authentication`] when credentials are
    /// rejected and [`crate::Error::Transport`] for anything worth retrying.
    async fn connect(
        &self,
        target: &TargetKey,
        auth: &AuthMaterial,
        dial: Dial,
    ) -> Result<Arc<dyn Session>>;
}

/// One authenticated transport.
#[async_trait]
pub trait Session: Send + Sync {
    /// Starts `command` on a new session channel.
    async fn open_exec(&self, command: &str, pty: Option<PtySize>) -> Result<Spawned>;

    /// Opens a direct-tcpip channel to `host:port`, declaring `origin` as
    /// the source address.
    async fn open_tunnel(&self, host: &str, port: u16, origin: &str) -> Result<TransportStream>;

    /// Opens a session channel bound to a subsystem such as `sftp`.
    async fn open_subsystem(&self, name: &str) -> Result<TransportStream>;

    /// Sends keepalive probes every `period`. Zero disables them.
    fn set_keepalive(&self, period: Duration);

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
