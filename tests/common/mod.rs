#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Questlink Session integration tests.
//!
//! Provides a scripted [`MockConnector`] whose dials hand out channel-backed
//! [`MockTransport`]s, the matching [`ServerEnd`] for driving them, and a
//! counting [`MockFetcher`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use questlink_session::connection::{ConnectionState, ConnectionStatus};
use questlink_session::protocol::ConnectRequest;
use questlink_session::{ChannelEvent, Connector, Identity, IdentityFetcher, SessionError, Transport};
use tokio::sync::{mpsc, watch};

/// Upper bound for any single wait in a test. Generous because paused-clock
/// tests auto-advance through it instantly when something is stuck.
pub const WAIT: Duration = Duration::from_secs(120);

/// Install a `tracing` subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── MockTransport ───────────────────────────────────────────────────

/// A channel-backed transport. The paired [`ServerEnd`] pushes incoming
/// messages; dropping its sender looks like a clean close by the server.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Result<String, SessionError>>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

/// The server side of one accepted [`MockTransport`].
pub struct ServerEnd {
    tx: StdMutex<Option<mpsc::UnboundedSender<Result<String, SessionError>>>>,
    /// Messages the client sent on this connection.
    pub sent: Arc<StdMutex<Vec<String>>>,
    /// Whether the client closed this connection.
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a transport plus the handle that drives it.
    pub fn pair() -> (Self, ServerEnd) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            incoming,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        let server = ServerEnd {
            tx: StdMutex::new(Some(tx)),
            sent,
            closed,
        };
        (transport, server)
    }
}

impl ServerEnd {
    /// Deliver a text message to the client.
    pub fn push(&self, text: &str) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    /// Deliver a receive error to the client.
    pub fn fail(&self, error: SessionError) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// Close the connection from the server side.
    pub fn hang_up(&self) {
        self.tx.lock().unwrap().take();
    }

    /// Snapshot of the messages the client sent.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Whether the client closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::TransportClosed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What a single dial does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    /// Hand out a fresh [`MockTransport`].
    Accept,
    /// Fail with a retryable error.
    Fail,
    /// Refuse the credential.
    Reject,
    /// Fail in a way no retry can fix.
    Misconfigured,
    /// Never complete.
    Hang,
}

/// A [`Connector`] following a script of [`Dial`]s, then a fallback.
///
/// Clones share the script and the recorded requests.
#[derive(Clone)]
pub struct MockConnector {
    script: Arc<StdMutex<VecDeque<Dial>>>,
    fallback: Arc<StdMutex<Dial>>,
    requests: Arc<StdMutex<Vec<ConnectRequest>>>,
    servers: Arc<StdMutex<Vec<Arc<ServerEnd>>>>,
}

impl MockConnector {
    /// Connector that accepts every dial.
    pub fn accepting() -> Self {
        Self::scripted(Vec::new(), Dial::Accept)
    }

    /// Connector that plays `script`, then answers every further dial with
    /// `fallback`.
    pub fn scripted(script: Vec<Dial>, fallback: Dial) -> Self {
        Self {
            script: Arc::new(StdMutex::new(VecDeque::from(script))),
            fallback: Arc::new(StdMutex::new(fallback)),
            requests: Arc::new(StdMutex::new(Vec::new())),
            servers: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Change the answer for dials once the script is exhausted.
    pub fn set_fallback(&self, dial: Dial) {
        *self.fallback.lock().unwrap() = dial;
    }

    /// Number of connect attempts so far.
    pub fn dials(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests of every connect attempt, in order.
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Server end of the `index`-th accepted connection.
    pub fn server(&self, index: usize) -> Arc<ServerEnd> {
        Arc::clone(&self.servers.lock().unwrap()[index])
    }

    /// Number of accepted connections.
    pub fn accepted(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, SessionError> {
        self.requests.lock().unwrap().push(request.clone());
        let dial = {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| *self.fallback.lock().unwrap())
        };
        match dial {
            Dial::Accept => {
                let (transport, server) = MockTransport::pair();
                self.servers.lock().unwrap().push(Arc::new(server));
                Ok(Box::new(transport))
            }
            Dial::Fail => Err(SessionError::ConnectFailed("connection refused".into())),
            Dial::Reject => Err(SessionError::AuthRejected("handshake refused with 401".into())),
            Dial::Misconfigured => Err(SessionError::Serialization(
                serde_json::from_str::<serde_json::Value>("{not json").unwrap_err(),
            )),
            Dial::Hang => std::future::pending().await,
        }
    }
}

// ── MockFetcher ─────────────────────────────────────────────────────

/// What the [`MockFetcher`] answers.
#[derive(Debug, Clone)]
pub enum Fetch {
    /// Resolve to this identity.
    Identity(Identity),
    /// Succeed without a payload.
    Empty,
    /// Fail like an unreachable network.
    NetworkError,
}

/// An [`IdentityFetcher`] returning a fixed answer and recording its calls.
#[derive(Clone)]
pub struct MockFetcher {
    answer: Fetch,
    calls: Arc<AtomicUsize>,
    seen: Arc<StdMutex<Vec<(String, String)>>>,
}

impl MockFetcher {
    /// Fetcher that always answers `answer`.
    pub fn new(answer: Fetch) -> Self {
        Self {
            answer,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Fetcher resolving every token to the user `id`.
    pub fn resolving(id: &str) -> Self {
        Self::new(Fetch::Identity(Identity::new(id)))
    }

    /// Number of fetches so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(locale, token)` of every fetch, in order.
    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityFetcher for MockFetcher {
    async fn fetch_identity(
        &self,
        locale: &str,
        token: &str,
    ) -> Result<Option<Identity>, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((locale.to_string(), token.to_string()));
        match &self.answer {
            Fetch::Identity(identity) => Ok(Some(identity.clone())),
            Fetch::Empty => Ok(None),
            Fetch::NetworkError => Err(SessionError::IdentityFetch("network unreachable".into())),
        }
    }
}

// ── Waiting helpers ─────────────────────────────────────────────────

/// Receive the next event, failing the test if none arrives.
pub async fn next_event(events: &mut mpsc::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Wait until the connection reaches `state` and return that status.
pub async fn wait_for_state(
    status: &mut watch::Receiver<ConnectionStatus>,
    state: ConnectionState,
) -> ConnectionStatus {
    let found = tokio::time::timeout(WAIT, status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .expect("connection actor stopped");
    *found
}

/// Wait until `connector` has seen at least `count` connect attempts.
pub async fn wait_for_dials(connector: &MockConnector, count: usize) {
    tokio::time::timeout(WAIT, async {
        while connector.dials() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {count} dials"));
}

/// Let every spawned task run until the runtime is idle again.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
