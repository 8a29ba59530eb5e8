//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] dials `ws://` or `wss://` endpoints, presenting the
//! session's bearer credential in the `Authorization` header of the upgrade
//! request. TLS is handled transparently via
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! A handshake refused with `401` or `403` maps to
//! [`SessionError::AuthRejected`], which stops the connection manager from
//! retrying with the same token.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), questlink_session::SessionError> {
//! use questlink_session::protocol::{AuthHeader, ConnectRequest};
//! use questlink_session::{Transport, WebSocketTransport};
//!
//! let request = ConnectRequest {
//!     url: "ws://localhost:4000/ws".into(),
//!     auth_header: AuthHeader::bearer("token"),
//!     user_id: "u1".into(),
//! };
//! let mut transport = WebSocketTransport::connect(&request).await?;
//! transport.send("hello".to_string()).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::SessionError;
use crate::protocol::ConnectRequest;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any messages.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open an authorized WebSocket connection for `request`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AuthRejected`] if the server answers the upgrade with
    ///   `401` or `403`.
    /// - [`SessionError::Io`] for socket-level failures.
    /// - [`SessionError::ConnectFailed`] for an invalid URL, an unusable
    ///   header value, or any other handshake failure.
    pub async fn connect(request: &ConnectRequest) -> Result<Self, SessionError> {
        tracing::debug!(url = %request.url, "connecting to WebSocket server");

        let mut upgrade = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::ConnectFailed(format!("invalid URL: {e}")))?;
        let header = HeaderValue::from_str(request.auth_header.as_str())
            .map_err(|e| SessionError::ConnectFailed(format!("invalid auth header: {e}")))?;
        upgrade.headers_mut().insert(AUTHORIZATION, header);

        let (stream, _response) = tokio_tungstenite::connect_async(upgrade)
            .await
            .map_err(map_handshake_error)?;

        tracing::info!(url = %request.url, "WebSocket connection established");

        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Wrap an already-established WebSocket stream.
    ///
    /// Useful for custom TLS, proxies, or any setup that
    /// [`connect`](Self::connect) does not expose.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

fn map_handshake_error(error: tokio_tungstenite::tungstenite::Error) -> SessionError {
    use tokio_tungstenite::tungstenite::Error;

    match error {
        Error::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            SessionError::AuthRejected(format!("handshake refused with {}", response.status()))
        }
        Error::Io(io) => SessionError::Io(io),
        other => SessionError::ConnectFailed(other.to_string()),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(SessionError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }
}

/// [`Connector`] that dials a fresh [`WebSocketTransport`] per attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, SessionError> {
        let transport = WebSocketTransport::connect(request).await?;
        Ok(Box::new(transport))
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
    use crate::protocol::AuthHeader;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn request_for(url: &str, token: &str) -> ConnectRequest {
        ConnectRequest {
            url: url.to_string(),
            auth_header: AuthHeader::bearer(token),
            user_id: "u1".into(),
        }
    }

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect(&request_for("not-a-valid-url", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = WebSocketTransport::connect(&request_for("ws://127.0.0.1:1", "t"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_auth_rejected());
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that checks the upgrade request's
    /// `Authorization` header against `expected_token`, then runs `handler`.
    async fn start_mock_server<F, Fut>(expected_token: &'static str, handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let check = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let expected = format!("Bearer {expected_token}");
                let presented = req
                    .headers()
                    .get("authorization")
                    .and_then(|value| value.to_str().ok());
                if presented == Some(expected.as_str()) {
                    Ok(resp)
                } else {
                    let mut refusal = ErrorResponse::new(Some("unauthorized".into()));
                    *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(refusal)
                }
            };
            if let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, check).await {
                handler(ws).await;
            }
        });

        format!("ws://{addr}")
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_presents_bearer_header() {
        let url = start_mock_server("good-token", |mut ws| async move {
            ws.send(Message::Text("welcome".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&request_for(&url, "good-token"))
            .await
            .unwrap();
        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, "welcome");
    }

    #[tokio::test]
    async fn refused_handshake_is_auth_rejected() {
        let url = start_mock_server("good-token", |_ws| async move {}).await;

        let err = WebSocketTransport::connect(&request_for(&url, "stale-token"))
            .await
            .unwrap_err();
        assert!(err.is_auth_rejected(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let url = start_mock_server("t", |mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&request_for(&url, "t")).await.unwrap();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let url = start_mock_server("t", |mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&request_for(&url, "t")).await.unwrap();
        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, "after_binary");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = start_mock_server("t", |mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&request_for(&url, "t")).await.unwrap();
        transport.close().await.unwrap();
        // Second close is a no-op.
        transport.close().await.unwrap();

        let err = transport.send("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, SessionError::TransportClosed));
    }

    #[tokio::test]
    async fn connector_produces_boxed_transport() {
        let url = start_mock_server("t", |mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new()
            .connect(&request_for(&url, "t"))
            .await
            .unwrap();
        transport.send("echo".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "echo");
    }
}
