//! Transport abstraction for the realtime channel.
//!
//! Two traits split the concern:
//!
//! - [`Connector`] dials one connect attempt, presenting the auth header from
//!   a [`ConnectRequest`]. The connection manager calls it once per attempt
//!   and bounds it with the policy's connect timeout.
//! - [`Transport`] is the connected, bidirectional text channel the dial
//!   produces. Framing (WebSocket frames, long-polling envelopes, ...) is the
//!   implementation's business.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use questlink_session::error::SessionError;
//! use questlink_session::protocol::ConnectRequest;
//! use questlink_session::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), SessionError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SessionError>> {
//!         // Return None when the connection is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SessionError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, SessionError> {
//!         // Dial request.url presenting request.auth_header
//!         todo!()
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::protocol::ConnectRequest;

/// A connected, bidirectional text message channel.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because the
/// connection manager polls it inside `tokio::select!`. If `recv` is cancelled
/// before completion, calling it again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one text message.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), SessionError>;

    /// Receive the next text message.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, SessionError>>;

    /// Close the connection gracefully. Closing twice must succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Dials the realtime server for one connect attempt.
///
/// A connector that starts on a polling fallback and upgrades to a socket
/// once the server allows it returns whichever [`Transport`] it ended up
/// with; the manager only sees the result.
///
/// Errors for which [`SessionError::is_retryable`] is false move the manager
/// straight to `Failed` instead of scheduling another attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a connection authorized with `request.auth_header`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthRejected`] when the server refuses the
    /// credential (the manager stops retrying), or any other error for
    /// failures worth retrying.
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, SessionError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, SessionError> {
        (**self).connect(request).await
    }
}
