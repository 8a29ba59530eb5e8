//! # Questlink Session
//!
//! Session-gated realtime connection lifecycle for the Questlink client.
//!
//! The crate keeps one authenticated session record per process, restores it
//! from durable storage on launch, resolves the stored token into a user
//! identity, and keeps a single realtime channel connected exactly while the
//! user is authenticated.
//!
//! ## Components
//!
//! - [`CredentialStore`]: the observable session record (token, identity,
//!   hydration flag) persisted through a pluggable [`Storage`](storage::Storage)
//! - [`IdentityFetcher`]: resolves a token into an [`Identity`]
//!   (`identity-http` feature provides `HttpIdentityFetcher`)
//! - [`BootstrapCoordinator`]: hydration, then at most one identity fetch
//! - [`ConnectionManager`]: the singleton channel's state machine with
//!   bounded retries, driven by [`on_auth_state_change`](ConnectionHandle::on_auth_state_change)
//! - [`SessionRuntime`]: wires the above together and exposes passive views
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Connector`] and [`Transport`] for any backend
//! - **WebSocket built-in**: default `transport-websocket` feature provides
//!   `WebSocketConnector`, which presents the token as a bearer header
//! - **Event-driven**: receive typed [`ChannelEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use questlink_session::{CredentialStore, RuntimeConfig, SessionRuntime, WebSocketConnector};
//! use questlink_session::storage::FileStorage;
//!
//! let store = CredentialStore::new(FileStorage::new("/var/lib/questlink"));
//! let (mut runtime, mut events) = SessionRuntime::start(
//!     store,
//!     my_identity_fetcher,
//!     WebSocketConnector::new(),
//!     RuntimeConfig::new("wss://realtime.example.com/ws"),
//! );
//!
//! while let Some(event) = events.recv().await {
//!     tracing::info!(?event, "realtime event");
//! }
//! runtime.shutdown().await;
//! ```

pub mod bootstrap;
pub mod connection;
pub mod error;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use bootstrap::{BootstrapConfig, BootstrapCoordinator, BootstrapPhase};
pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus,
    ReconnectPolicy,
};
pub use error::SessionError;
pub use event::ChannelEvent;
pub use identity::IdentityFetcher;
pub use runtime::{ConnectionView, RuntimeConfig, SessionRuntime, SessionView};
pub use session::{CredentialStore, Identity, Session};
pub use transport::{Connector, Transport};

#[cfg(feature = "identity-http")]
pub use identity::HttpIdentityFetcher;

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
