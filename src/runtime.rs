//! Process-scoped wiring of the session components.
//!
//! [`SessionRuntime`] owns one [`CredentialStore`], one
//! [`BootstrapCoordinator`] and one [`ConnectionManager`], and runs a bridge
//! task that forwards every store change to
//! [`ConnectionHandle::on_auth_state_change`]. Consumers read the passive
//! [`SessionView`] and [`ConnectionView`]; neither triggers any work.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = RuntimeConfig::new("wss://realtime.example.com/ws").with_locale("de");
//! let (mut runtime, mut events) = SessionRuntime::start(
//!     CredentialStore::new(FileStorage::new(data_dir)),
//!     HttpIdentityFetcher::new("https://api.example.com")?,
//!     WebSocketConnector::new(),
//!     config,
//! );
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?} loading={}", runtime.session().is_loading);
//! }
//! runtime.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bootstrap::{BootstrapConfig, BootstrapCoordinator};
use crate::connection::{ConnectionConfig, ConnectionHandle, ConnectionManager, ReconnectPolicy};
use crate::event::ChannelEvent;
use crate::identity::IdentityFetcher;
use crate::session::{CredentialStore, Identity, Session, SessionSubscription};
use crate::transport::Connector;

/// Configuration for a [`SessionRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bootstrap settings.
    pub bootstrap: BootstrapConfig,
    /// Realtime channel settings.
    pub connection: ConnectionConfig,
}

impl RuntimeConfig {
    /// Default configuration for the realtime server at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            bootstrap: BootstrapConfig::default(),
            connection: ConnectionConfig::new(url),
        }
    }

    /// Set the locale forwarded to the identity fetcher.
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.bootstrap = self.bootstrap.with_locale(locale);
        self
    }

    /// Set the realtime channel's retry policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.connection = self.connection.with_reconnect_policy(policy);
        self
    }

    /// Replace the whole connection configuration.
    #[must_use]
    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// What a consumer sees of the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    /// `true` while an identity is held.
    pub is_authenticated: bool,
    /// `true` until the bootstrap cycle is done.
    pub is_loading: bool,
    /// The resolved identity, if any.
    pub identity: Option<Identity>,
}

/// What a consumer sees of the realtime channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionView {
    /// `true` while the channel is live.
    pub is_connected: bool,
}

/// The session stack of one process.
pub struct SessionRuntime {
    store: CredentialStore,
    bootstrap: BootstrapCoordinator,
    connection: ConnectionManager,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionRuntime {
    /// Start hydration, the bootstrap cycle and the auth-state bridge.
    ///
    /// Must be called inside a Tokio runtime. The returned receiver carries
    /// the realtime channel's events.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        store: CredentialStore,
        fetcher: impl IdentityFetcher,
        connector: impl Connector,
        config: RuntimeConfig,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (connection, events) = ConnectionManager::start(connector, config.connection);
        let bootstrap = BootstrapCoordinator::with_shared_fetcher(
            store.clone(),
            Arc::new(fetcher),
            config.bootstrap,
        );

        // Subscribe before hydrating so the bridge sees the hydrated record.
        let subscription = store.subscribe();
        let bridge = tokio::spawn(bridge_auth_state(subscription, connection.handle()));
        let coordinator = bootstrap.spawn();
        let hydrate = {
            let store = store.clone();
            tokio::spawn(async move { store.hydrate().await })
        };

        let runtime = Self {
            store,
            bootstrap,
            connection,
            tasks: vec![hydrate, coordinator, bridge],
        };
        (runtime, events)
    }

    /// Current session view.
    pub fn session(&self) -> SessionView {
        let session = self.store.snapshot();
        SessionView {
            is_authenticated: session.is_authenticated,
            is_loading: self.bootstrap.is_loading(),
            identity: session.identity,
        }
    }

    /// Current connection view.
    pub fn connection(&self) -> ConnectionView {
        ConnectionView {
            is_connected: self.connection.is_connected(),
        }
    }

    /// The credential store, for login and logout.
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// The bootstrap coordinator.
    pub fn bootstrap(&self) -> &BootstrapCoordinator {
        &self.bootstrap
    }

    /// The realtime channel's manager.
    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Stop the background tasks and close the realtime channel.
    pub async fn shutdown(&mut self) {
        debug!("SessionRuntime: shutdown requested");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.connection.shutdown().await;
    }
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("session", &self.session())
            .field("connection", &self.connection())
            .finish()
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Forward the latest session record to the connection manager, once now and
/// again on every change. Intermediate records may be skipped.
async fn bridge_auth_state(mut subscription: SessionSubscription, connection: ConnectionHandle) {
    let mut session = subscription.current();
    loop {
        forward(&session, &connection);
        match subscription.changed().await {
            Some(next) => session = next,
            None => {
                debug!("credential store dropped, auth bridge exiting");
                return;
            }
        }
    }
}

fn forward(session: &Session, connection: &ConnectionHandle) {
    connection.on_auth_state_change(
        session.is_authenticated,
        session.user_id(),
        session.token.as_deref(),
    );
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
    use std::time::Duration;

    #[test]
    fn runtime_config_builders() {
        let config = RuntimeConfig::new("ws://localhost:4000/ws")
            .with_locale("fr")
            .with_reconnect_policy(ReconnectPolicy::default().with_max_attempts(2));
        assert_eq!(config.bootstrap.locale, "fr");
        assert_eq!(config.connection.url, "ws://localhost:4000/ws");
        assert_eq!(config.connection.reconnect.max_attempts, 2);

        let config = config.with_connection_config(
            ConnectionConfig::new("ws://other").with_shutdown_timeout(Duration::from_secs(3)),
        );
        assert_eq!(config.connection.url, "ws://other");
        assert_eq!(config.connection.reconnect.max_attempts, 5);
        assert_eq!(config.bootstrap.locale, "fr");
    }

    #[test]
    fn default_views_are_signed_out() {
        let session = SessionView::default();
        assert!(!session.is_authenticated);
        assert!(session.identity.is_none());
        assert!(!ConnectionView::default().is_connected);
    }
}
