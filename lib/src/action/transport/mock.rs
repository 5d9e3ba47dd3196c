//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use super::Connector;
use super::Dial;
use super::Session;
use super::TransportStream;
use crate::action::engine::Process;
use crate::action::engine::ProcessEvent;
use crate::action::engine::Spawned;
use crate::action::result::ExitCode;
use crate::action::PtySize;
use crate::auth::AuthMaterial;
use crate::resolve::TargetKey;
use crate::Error;
use crate::Result;

// Process --------------------------------------------------------------------

/// Scripted command behaviour. Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct Script {
    events: Vec<ProcessEvent>,
    hang: bool,
    fail: bool,
    pub closed: Arc<AtomicBool>,
    pub polls: Arc<AtomicUsize>,
    /// Standard input as it was when output was first polled.
    pub stdin_at_first_poll: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.events.push(ProcessEvent::Stdout(text.as_bytes().to_vec()));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.events.push(ProcessEvent::Stderr(text.as_bytes().to_vec()));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.events.push(ProcessEvent::Exit(ExitCode::from(code)));
        self
    }

    /// Never ends after the scripted events.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Fails when drained after the scripted events.
    pub fn fail(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Starts the script, returning the spawned command and its stdin sink.
    pub fn spawn(&self) -> (Spawned, Arc<Mutex<Vec<u8>>>) {
        let stdin = Arc::new(Mutex::new(Vec::new()));
        let process = MockProcess {
            events: self.events.iter().cloned().collect(),
            script: self.clone(),
            stdin: Arc::clone(&stdin),
        };
        let spawned = Spawned {
            process: Box::new(process),
            stdin: Some(Box::new(SharedWriter(Arc::clone(&stdin)))),
        };
        (spawned, stdin)
    }
}

struct MockProcess {
    events: VecDeque<ProcessEvent>,
    script: Script,
    stdin: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl Process for MockProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>> {
        if self.script.polls.fetch_add(1, Ordering::SeqCst) == 0 {
            *self.script.stdin_at_first_poll.lock() = Some(self.stdin.lock().clone());
        }
        if self.script.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(event) = self.events.pop_front() {
            tokio::task::yield_now().await;
            return Ok(Some(event));
        }
        if self.script.fail {
            return Err(Error::channel(
                &TargetKey::local(),
                anyhow::anyhow!("channel reset"),
            ));
        }
        if self.script.hang {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.script.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Standard input sink shared with the test.
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SharedWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// Connector ------------------------------------------------------------------

/// Failure to inject into the next connect attempt.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Let this attempt through.
    Pass,
    Transient,
    Auth,
}

/// One connect attempt as seen by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub target: TargetKey,
    pub user: String,
    pub dial: String,
}

type Responder = dyn Fn(&TargetKey, &str) -> Script + Send + Sync;

/// Connector handing out [`MockSession`]s.
#[derive(Clone)]
pub struct MockConnector {
    pub attempts: Arc<Mutex<Vec<Attempt>>>,
    pub sessions: Arc<Mutex<Vec<Arc<MockSession>>>>,
    failures: Arc<Mutex<VecDeque<Failure>>>,
    responder: Arc<Responder>,
}

impl MockConnector {
    /// Every command exits 0 without output.
    pub fn new() -> Self {
        Self::responding(|_, _| Script::new().exit(0))
    }

    pub fn responding(responder: impl Fn(&TargetKey, &str) -> Script + Send + Sync + 'static) -> Self {
        Self {
            attempts: Arc::default(),
            sessions: Arc::default(),
            failures: Arc::default(),
            responder: Arc::new(responder),
        }
    }

    /// Queues failures for the next connect attempts, in order.
    pub fn failing(self, failures: impl IntoIterator<Item = Failure>) -> Self {
        self.failures.lock().extend(failures);
        self
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock()[index])
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &TargetKey,
        auth: &AuthMaterial,
        dial: Dial,
    ) -> Result<Arc<dyn Session>> {
        let dial = match dial {
            Dial::Direct => "direct".to_owned(),
            Dial::ProxyCommand(command) => format!("proxy-command:{command}"),
            Dial::Stream(_) => "stream".to_owned(),
        };
        self.attempts.lock().push(Attempt {
            target: target.clone(),
            user: auth.username().to_owned(),
            dial,
        });

        match self.failures.lock().pop_front() {
            Some(Failure::Transient) => {
                return Err(Error::transport(target, anyhow::anyhow!("connection reset")));
            }
            Some(Failure::Auth) => {
                return Err(Error::Authentication {
                    target: target.clone(),
                    user: auth.username().to_owned(),
                    reason: "denied".into(),
                });
            }
            Some(Failure::Pass) | None => {}
        }

        let session = Arc::new(MockSession {
            target: target.clone(),
            closed: AtomicBool::new(false),
            keepalive: Mutex::new(Duration::ZERO),
            commands: Mutex::default(),
            tunnels: Mutex::default(),
            scripts: Mutex::default(),
            responder: Arc::clone(&self.responder),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Session recording everything asked of it.
pub struct MockSession {
    pub target: TargetKey,
    pub closed: AtomicBool,
    pub keepalive: Mutex<Duration>,
    pub commands: Mutex<Vec<String>>,
    pub tunnels: Mutex<Vec<(String, u16, String)>>,
    pub scripts: Mutex<Vec<Script>>,
    responder: Arc<Responder>,
}

impl MockSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn keepalive(&self) -> Duration {
        *self.keepalive.lock()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open_exec(&self, command: &str, _pty: Option<PtySize>) -> Result<Spawned> {
        if self.is_closed() {
            return Err(Error::channel(&self.target, anyhow::anyhow!("session closed")));
        }
        self.commands.lock().push(command.to_owned());
        let script = (self.responder)(&self.target, command);
        let (spawned, _stdin) = script.spawn();
        self.scripts.lock().push(script);
        Ok(spawned)
    }

    async fn open_tunnel(&self, host: &str, port: u16, origin: &str) -> Result<TransportStream> {
        self.tunnels
            .lock()
            .push((host.to_owned(), port, origin.to_owned()));
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(near))
    }

    async fn open_subsystem(&self, name: &str) -> Result<TransportStream> {
        Err(Error::channel(
            &self.target,
            anyhow::anyhow!("subsystem {name} unsupported"),
        ))
    }

    fn set_keepalive(&self, period: Duration) {
        *self.keepalive.lock() = period;
    }

    fn is_closed(&self) -> bool {
        MockSession::is_closed(self)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
