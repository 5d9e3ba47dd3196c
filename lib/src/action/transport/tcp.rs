use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::resolve::TargetKey;
use crate::Error;
use crate::Result;

/// Opens plain TCP connections to SSH servers.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TcpDialer {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connects to `target`, resolving its host name if needed.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] if the connection is refused or times out.
    pub async fn dial(&self, target: &TargetKey) -> Result<TcpStream> {
        let addr = (target.host.as_str(), target.port);
        let connect = async {
            let tcp = timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .context("TCP connect timed out")?
                .context("TCP connect failed")?;
            if let Err(error) = tcp.set_nodelay(true) {
                debug!(?error, "unable to set TCP_NODELAY");
            }
            anyhow::Ok(tcp)
        };
        connect.await.map_err(|error| Error::transport(target, error))
    }
}

// Tests ----------------------------------------------------------------------
