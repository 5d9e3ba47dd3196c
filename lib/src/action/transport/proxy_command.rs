//! Transport over the stdin/stdout of a spawned `ProxyCommand`.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::Context;
use std::task::Poll;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tracing::debug;

/// Substitutes `%h`, `%p`, `%r` and `%%` the way ssh_config does.
///
/// Unknown escapes are kept as written.
#[must_use]
pub fn expand(template: &str, host: &str, port: u16, user: &str) -> String {
    let mut expanded = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            expanded.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => expanded.push_str(host),
            Some('p') => expanded.push_str(&port.to_string()),
            Some('r') => expanded.push_str(user),
            Some('%') => expanded.push('%'),
            Some(other) => {
                expanded.push('%');
                expanded.push(other);
            }
            None => expanded.push('%'),
        }
    }
    expanded
}

/// Byte stream backed by a child process. The child is killed on drop.
pub struct ProxyCommandStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProxyCommandStream {
    /// Runs `command` through `sh -c`. Its stderr goes to ours.
    ///
    /// # Errors
    ///
    /// If the shell cannot be spawned.
    pub fn spawn(command: &str) -> io::Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        debug!(pid = ?child.id(), %command, "spawned proxy command");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("proxy command has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("proxy command has no stdout"))?;
        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for ProxyCommandStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyCommandStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[rstest]
    #[case::netcat("nc %h %p", "nc db.lan 2222")]
    #[case::jump("ssh -W %h:%p %r@gw", "ssh -W db.lan:2222 admin@gw")]
    #[case::literal("echo 100%%", "echo 100%")]
    #[case::unknown("echo %x %", "echo %x %")]
    fn expands(#[case] template: &str, #[case] expected: &str) {
        assert_eq!(expand(template, "db.lan", 2222, "admin"), expected);
    }

    #[tokio::test]
    async fn talks_through_child() {
        let mut stream = ProxyCommandStream::spawn("cat").unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
