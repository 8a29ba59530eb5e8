//! Connection lifecycle manager for the singleton realtime channel.
//!
//! [`ConnectionManager`] is a handle to a background actor task that owns the
//! one channel object of the process. Commands reach the actor over an
//! unbounded MPSC channel and are applied strictly in arrival order; the actor
//! publishes its [`ConnectionStatus`] on a watch channel and emits
//! [`ChannelEvent`]s on a bounded channel returned from
//! [`ConnectionManager::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ConnectionConfig::new("wss://realtime.example.com/ws");
//! let (manager, mut events) = ConnectionManager::start(WebSocketConnector::new(), config);
//!
//! manager.on_auth_state_change(true, Some("u1"), Some("token"));
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ChannelEvent::Connected { .. } => { /* … */ }
//!         ChannelEvent::Failed { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect--> Connecting --success--> Connected
//! Connecting   --failure--> Reconnecting (attempts left) | Failed
//! Reconnecting --timer----> Connecting
//! Connected    --drop-----> Reconnecting
//! any          --disconnect()--> Disconnected
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::event::ChannelEvent;
use crate::protocol::{AuthHeader, ClientFrame, ConnectRequest};
use crate::transport::{Connector, Transport};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default ceiling of consecutive failed connect attempts.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay between connect attempts.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default bound on a single connect attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Stand-in deadline for a reconnect delay too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ── Configuration ───────────────────────────────────────────────────

/// How the delay between reconnect attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// The same delay before every attempt.
    #[default]
    Fixed,
    /// Delay doubles with each attempt, capped at `max_delay`.
    Exponential {
        /// Upper bound for a single delay.
        max_delay: Duration,
    },
}

/// Retry policy for the realtime channel.
///
/// # Example
///
/// ```
/// use questlink_session::connection::{Backoff, ReconnectPolicy};
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::default()
///     .with_max_attempts(3)
///     .with_backoff(Backoff::Exponential { max_delay: Duration::from_secs(8) });
/// assert_eq!(policy.delay_before_retry(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_before_retry(3), Duration::from_secs(4));
/// assert_eq!(policy.delay_before_retry(10), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts after which the manager gives up.
    ///
    /// Defaults to **5**. Values below 1 are clamped to 1.
    pub max_attempts: u32,
    /// Base delay between attempts. Defaults to **1 second**.
    pub delay: Duration,
    /// Growth of the delay. Defaults to [`Backoff::Fixed`].
    pub backoff: Backoff,
    /// Bound on a single connect attempt; expiry counts as a failure.
    ///
    /// Defaults to **20 seconds**.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
            backoff: Backoff::Fixed,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    /// Set the ceiling of consecutive failed attempts. Values below 1 are
    /// clamped to 1.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base delay between attempts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set how the delay grows between attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the bound on a single connect attempt.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Delay before the `retry`-th reconnect attempt (1-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let exponent = retry.saturating_sub(1).min(31);
                self.delay
                    .checked_mul(1u32 << exponent)
                    .map_or(max_delay, |delay| delay.min(max_delay))
            }
        }
    }
}

/// Configuration for a [`ConnectionManager`].
///
/// The only required field is the server `url`; all others have defaults.
///
/// # Example
///
/// ```
/// use questlink_session::connection::{ConnectionConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let config = ConnectionConfig::new("wss://realtime.example.com/ws")
///     .with_reconnect_policy(ReconnectPolicy::default().with_max_attempts(3))
///     .with_shutdown_timeout(Duration::from_secs(2));
/// assert_eq!(config.reconnect.max_attempts, 3);
/// assert_eq!(config.event_channel_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint of the realtime server.
    pub url: String,
    /// Retry behavior.
    pub reconnect: ReconnectPolicy,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, events are dropped with a warning and
    /// the state machine keeps running. Only the final `Disconnected` after
    /// [`ConnectionManager::shutdown`] waits for room in the channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time [`ConnectionManager::shutdown`] waits for the actor to close the
    /// channel before aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a configuration for `url` with default values.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are
    /// clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// State of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and nothing scheduled.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The channel is live.
    Connected,
    /// Waiting for the reconnect timer.
    Reconnecting,
    /// Gave up; waits for the next auth-state change.
    Failed,
}

/// Observable snapshot of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    pub attempt: u32,
    /// Identity of the channel object, once created.
    pub channel_id: Option<Uuid>,
}

impl ConnectionStatus {
    /// Returns `true` while the channel is live.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

// ── Manager handle ──────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    EnsureConnected { token: String, user_id: String },
    Disconnect,
    Send(String),
}

/// Cloneable command handle to the connection actor.
///
/// Every method enqueues a command and returns immediately. None of them
/// reports connection failures: those are absorbed by the actor, logged, and
/// surfaced only as [`ChannelEvent`]s and [`ConnectionStatus`] changes.
/// Commands sent after the actor stopped are ignored.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    /// Make sure the channel is connected with `token`.
    ///
    /// Creates the channel object on first use. Calling this again with the
    /// same credentials while connecting or connected is a no-op; a different
    /// token tears down the current connection before dialing again.
    pub fn ensure_connected(&self, token: &str, user_id: &str) {
        self.command(Command::EnsureConnected {
            token: token.to_string(),
            user_id: user_id.to_string(),
        });
    }

    /// Tear down the connection and cancel any pending reconnect.
    ///
    /// The channel object is kept for reuse. Safe to call when already
    /// disconnected.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Apply an authentication snapshot: connect when authenticated with both
    /// a user id and a token, disconnect otherwise.
    ///
    /// Idempotent for repeated identical snapshots. Empty strings count as
    /// absent.
    pub fn on_auth_state_change(
        &self,
        is_authenticated: bool,
        user_id: Option<&str>,
        token: Option<&str>,
    ) {
        let user_id = user_id.filter(|id| !id.is_empty());
        let token = token.filter(|token| !token.is_empty());
        match (is_authenticated, user_id, token) {
            (true, Some(user_id), Some(token)) => self.ensure_connected(token, user_id),
            _ => self.disconnect(),
        }
    }

    /// Queue a text message on the live channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if the channel is not connected.
    pub fn send(&self, message: impl Into<String>) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.cmd_tx
            .send(Command::Send(message.into()))
            .map_err(|_| SessionError::NotConnected)
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Returns `true` while the channel is live.
    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    fn command(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("connection actor has stopped; command ignored");
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("status", &self.status())
            .finish()
    }
}

/// Owner of the connection actor task.
///
/// Exactly one per process: it owns the singleton channel. Use
/// [`handle`](Self::handle) to give other components a way to drive it.
pub struct ConnectionManager {
    handle: ConnectionHandle,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    /// Spawn the connection actor and return the manager plus event receiver.
    ///
    /// No connection is attempted until the first
    /// [`ensure_connected`](ConnectionHandle::ensure_connected).
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        connector: impl Connector,
        config: ConnectionConfig,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(capacity);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel::<DialOutcome>();

        let actor = ConnectionActor {
            connector: Arc::new(connector),
            url: config.url,
            policy: config.reconnect,
            channel: None,
            state: ConnectionState::Disconnected,
            failures: 0,
            retries: 0,
            attempt_id: 0,
            retry_at: None,
            dial: None,
            event_tx,
            status_tx,
            outcome_tx,
        };

        let task = tokio::spawn(connection_loop(actor, cmd_rx, outcome_rx, shutdown_rx));

        let manager = Self {
            handle: ConnectionHandle { cmd_tx, status_rx },
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (manager, event_rx)
    }

    /// A cloneable handle for driving the actor.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// See [`ConnectionHandle::ensure_connected`].
    pub fn ensure_connected(&self, token: &str, user_id: &str) {
        self.handle.ensure_connected(token, user_id);
    }

    /// See [`ConnectionHandle::disconnect`].
    pub fn disconnect(&self) {
        self.handle.disconnect();
    }

    /// See [`ConnectionHandle::on_auth_state_change`].
    pub fn on_auth_state_change(
        &self,
        is_authenticated: bool,
        user_id: Option<&str>,
        token: Option<&str>,
    ) {
        self.handle
            .on_auth_state_change(is_authenticated, user_id, token);
    }

    /// See [`ConnectionHandle::send`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if the channel is not connected.
    pub fn send(&self, message: impl Into<String>) -> Result<()> {
        self.handle.send(message)
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// Returns `true` while the channel is live.
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.handle.subscribe_status()
    }

    /// Stop the actor, closing any live connection.
    ///
    /// After this the event receiver yields `None` once drained, and further
    /// commands from any handle are ignored.
    pub async fn shutdown(&mut self) {
        debug!("ConnectionManager: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // If the actor does not exit in time, abort it so it cannot run on
        // detached.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection actor terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection actor did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection actor aborted: {join_err}");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // `Drop` cannot await a graceful close; abort the actor instead.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Actor ───────────────────────────────────────────────────────────

/// The singleton channel object. Created on first use, never replaced.
struct Channel {
    id: Uuid,
    auth_header: AuthHeader,
    user_id: String,
    transport: Option<Box<dyn Transport>>,
}

/// Result of one dial, tagged with the attempt that produced it.
struct DialOutcome {
    attempt_id: u64,
    result: Result<Box<dyn Transport>>,
}

struct ConnectionActor {
    connector: Arc<dyn Connector>,
    url: String,
    policy: ReconnectPolicy,
    channel: Option<Channel>,
    state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    failures: u32,
    /// Reconnect attempts started since the last successful connect.
    retries: u32,
    /// Id of the only dial whose outcome is still wanted.
    attempt_id: u64,
    retry_at: Option<Instant>,
    dial: Option<JoinHandle<()>>,
    event_tx: mpsc::Sender<ChannelEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    outcome_tx: mpsc::UnboundedSender<DialOutcome>,
}

/// Background loop driving the connection state machine.
///
/// Exits when the shutdown signal fires or every handle has been dropped.
async fn connection_loop(
    mut actor: ConnectionActor,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut outcome_rx: mpsc::UnboundedReceiver<DialOutcome>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("connection loop started");

    loop {
        let retry_at = actor.retry_at;
        let live = actor
            .channel
            .as_mut()
            .and_then(|channel| channel.transport.as_mut());

        tokio::select! {
            // Commands before outcomes: a queued logout beats a connect
            // outcome that became ready in the same turn.
            biased;

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => actor.handle_command(cmd).await,
                    None => {
                        debug!("command channel closed, shutting down connection loop");
                        break;
                    }
                }
            }

            Some(outcome) = outcome_rx.recv() => {
                actor.handle_outcome(outcome).await;
            }

            () = sleep_until(retry_at) => {
                actor.retry();
            }

            incoming = recv_live(live) => {
                match incoming {
                    Some(Ok(text)) => actor.emit(ChannelEvent::Message(text)),
                    Some(Err(e)) => {
                        warn!("transport receive error: {e}");
                        actor.connection_lost(Some(format!("transport receive error: {e}"))).await;
                    }
                    None => {
                        debug!("transport closed by server");
                        actor.connection_lost(Some("closed by server".into())).await;
                    }
                }
            }
        }
    }

    actor.finish(Some("client shut down".into())).await;
    debug!("connection loop exited");
}

impl ConnectionActor {
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::EnsureConnected { token, user_id } => {
                self.ensure_connected(AuthHeader::bearer(&token), user_id)
                    .await;
            }
            Command::Disconnect => match self.state {
                ConnectionState::Disconnected => {
                    debug!("disconnect: already disconnected");
                }
                ConnectionState::Failed => {
                    self.state = ConnectionState::Disconnected;
                    self.failures = 0;
                    self.publish();
                }
                _ => self.teardown(Some("client disconnect".into())).await,
            },
            Command::Send(text) => {
                let result = match self
                    .channel
                    .as_mut()
                    .and_then(|channel| channel.transport.as_mut())
                {
                    Some(transport) => transport.send(text).await,
                    None => {
                        warn!("send requested while not connected; message dropped");
                        return;
                    }
                };
                if let Err(e) = result {
                    warn!("transport send error: {e}");
                    self.connection_lost(Some(format!("transport send error: {e}")))
                        .await;
                }
            }
        }
    }

    async fn ensure_connected(&mut self, auth_header: AuthHeader, user_id: String) {
        let channel = self.channel.get_or_insert_with(|| {
            let id = Uuid::new_v4();
            info!(channel_id = %id, "realtime channel created");
            Channel {
                id,
                auth_header: auth_header.clone(),
                user_id: user_id.clone(),
                transport: None,
            }
        });
        let same_credentials = channel.auth_header == auth_header && channel.user_id == user_id;

        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                if same_credentials {
                    debug!(state = ?self.state, "ensure_connected: nothing to do");
                    return;
                }
                info!("credentials changed; reconnecting with the new token");
                self.teardown(Some("credentials changed".into())).await;
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }

        if let Some(channel) = self.channel.as_mut() {
            channel.auth_header = auth_header;
            channel.user_id = user_id;
        }
        self.failures = 0;
        self.retries = 0;
        self.dial();
    }

    /// Start a connect attempt on a background task.
    fn dial(&mut self) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };

        self.attempt_id = self.attempt_id.wrapping_add(1);
        let attempt_id = self.attempt_id;
        let request = ConnectRequest {
            url: self.url.clone(),
            auth_header: channel.auth_header.clone(),
            user_id: channel.user_id.clone(),
        };
        let connector = Arc::clone(&self.connector);
        let outcome_tx = self.outcome_tx.clone();
        let timeout = self.policy.connect_timeout;

        debug!(attempt_id, url = %request.url, "dialing realtime server");
        self.retry_at = None;
        self.state = ConnectionState::Connecting;
        self.publish();

        self.dial = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&request)).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::ConnectTimeout),
            };
            // The receiver only goes away when the loop has exited.
            let _ = outcome_tx.send(DialOutcome { attempt_id, result });
        }));
    }

    async fn handle_outcome(&mut self, outcome: DialOutcome) {
        if outcome.attempt_id != self.attempt_id || self.state != ConnectionState::Connecting {
            debug!(
                attempt_id = outcome.attempt_id,
                current = self.attempt_id,
                "discarding outcome of a superseded connect attempt"
            );
            if let Ok(mut transport) = outcome.result {
                let _ = transport.close().await;
            }
            return;
        }
        self.dial = None;

        let mut transport = match outcome.result {
            Ok(transport) => transport,
            Err(e) => {
                self.connect_failed(e);
                return;
            }
        };

        let Some(channel) = self.channel.as_mut() else {
            let _ = transport.close().await;
            return;
        };

        let identify = ClientFrame::Identify {
            user_id: channel.user_id.clone(),
        };
        let sent = match serde_json::to_string(&identify) {
            Ok(json) => transport.send(json).await,
            Err(e) => Err(SessionError::Serialization(e)),
        };
        if let Err(e) = sent {
            let _ = transport.close().await;
            self.connect_failed(e);
            return;
        }

        channel.transport = Some(transport);
        let channel_id = channel.id;
        self.failures = 0;
        self.retries = 0;
        self.state = ConnectionState::Connected;
        self.publish();
        info!(channel_id = %channel_id, "realtime channel connected");
        self.emit(ChannelEvent::Connected { channel_id });
    }

    fn connect_failed(&mut self, error: SessionError) {
        self.failures = self.failures.saturating_add(1);
        warn!(error = %error, failures = self.failures, "connect attempt failed");
        self.emit(ChannelEvent::ConnectError {
            message: error.to_string(),
        });

        if error.is_auth_rejected() {
            self.give_up(error.to_string());
        } else if !error.is_retryable() {
            self.give_up(format!("unrecoverable connect error: {error}"));
        } else if self.failures >= self.policy.max_attempts {
            self.give_up(format!("gave up after {} failed attempts", self.failures));
        } else {
            self.schedule_retry();
        }
    }

    /// The live connection dropped on its own.
    async fn connection_lost(&mut self, reason: Option<String>) {
        if let Some(mut transport) = self
            .channel
            .as_mut()
            .and_then(|channel| channel.transport.take())
        {
            let _ = transport.close().await;
        }
        self.failures = 0;
        self.retries = 0;
        self.emit(ChannelEvent::Disconnected { reason });
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let retry = self.retries.saturating_add(1);
        let delay = self.policy.delay_before_retry(retry);
        debug!(retry, ?delay, "scheduling reconnect");
        let now = Instant::now();
        self.retry_at = Some(now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE));
        self.state = ConnectionState::Reconnecting;
        self.publish();
    }

    fn retry(&mut self) {
        self.retry_at = None;
        if self.state != ConnectionState::Reconnecting {
            return;
        }
        self.retries = self.retries.saturating_add(1);
        info!(attempt = self.retries, "reconnecting realtime channel");
        self.emit(ChannelEvent::Reconnecting {
            attempt: self.retries,
        });
        self.dial();
    }

    fn give_up(&mut self, reason: String) {
        warn!(%reason, "realtime channel failed; waiting for new credentials");
        self.retry_at = None;
        self.state = ConnectionState::Failed;
        self.publish();
        self.emit(ChannelEvent::Failed { reason });
    }

    async fn teardown(&mut self, reason: Option<String>) {
        if let Some(event) = self.close(reason).await {
            self.emit(event);
        }
    }

    /// Final teardown once the loop has exited. Unlike every event emitted
    /// while the loop runs, the closing `Disconnected` waits for capacity.
    async fn finish(mut self, reason: Option<String>) {
        if let Some(event) = self.close(reason).await {
            if self.event_tx.send(event).await.is_err() {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    /// Invalidate in-flight work, close the live connection and settle in
    /// `Disconnected`. The channel object survives.
    ///
    /// Returns the `Disconnected` event to report, if anything was running.
    async fn close(&mut self, reason: Option<String>) -> Option<ChannelEvent> {
        self.attempt_id = self.attempt_id.wrapping_add(1);
        self.retry_at = None;
        if let Some(dial) = self.dial.take() {
            dial.abort();
        }
        if let Some(mut transport) = self
            .channel
            .as_mut()
            .and_then(|channel| channel.transport.take())
        {
            if let Err(e) = transport.close().await {
                debug!("error closing transport: {e}");
            }
        }

        let was = self.state;
        self.state = ConnectionState::Disconnected;
        self.failures = 0;
        self.retries = 0;
        self.publish();

        if was == ConnectionState::Disconnected || was == ConnectionState::Failed {
            return None;
        }
        info!(?reason, "realtime channel disconnected");
        Some(ChannelEvent::Disconnected { reason })
    }

    fn publish(&self) {
        let status = ConnectionStatus {
            state: self.state,
            attempt: self.failures,
            channel_id: self.channel.as_ref().map(|channel| channel.id),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Emit an event without blocking the loop; dropped with a warning when
    /// the consumer falls behind.
    fn emit(&self, event: ChannelEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_live(transport: Option<&mut Box<dyn Transport>>) -> Option<Result<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ConnectionConfig::new("ws://localhost:4000/ws");
        assert_eq!(config.url, "ws://localhost:4000/ws");
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.backoff, Backoff::Fixed);
        assert_eq!(config.reconnect.connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn capacity_and_attempts_are_clamped() {
        let config = ConnectionConfig::new("ws://x").with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
        let policy = ReconnectPolicy::default().with_max_attempts(0);
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = ReconnectPolicy::default().with_delay(Duration::from_millis(250));
        assert_eq!(policy.delay_before_retry(1), Duration::from_millis(250));
        assert_eq!(policy.delay_before_retry(40), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::default().with_backoff(Backoff::Exponential {
            max_delay: Duration::from_secs(5),
        });
        assert_eq!(policy.delay_before_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before_retry(4), Duration::from_secs(5));
        assert_eq!(policy.delay_before_retry(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn status_reports_connected_only_when_live() {
        let mut status = ConnectionStatus::default();
        assert!(!status.is_connected());
        status.state = ConnectionState::Reconnecting;
        assert!(!status.is_connected());
        status.state = ConnectionState::Connected;
        assert!(status.is_connected());
    }

    #[test]
    fn on_auth_state_change_requires_both_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let handle = ConnectionHandle {
            cmd_tx: tx,
            status_rx,
        };

        handle.on_auth_state_change(true, Some("u1"), Some("tok"));
        handle.on_auth_state_change(true, None, Some("tok"));
        handle.on_auth_state_change(true, Some("u1"), Some(""));
        handle.on_auth_state_change(false, Some("u1"), Some("tok"));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Command::EnsureConnected { ref token, ref user_id } if token == "tok" && user_id == "u1"
        ));
        assert!(matches!(rx.try_recv().unwrap(), Command::Disconnect));
        assert!(matches!(rx.try_recv().unwrap(), Command::Disconnect));
        assert!(matches!(rx.try_recv().unwrap(), Command::Disconnect));
    }
}
