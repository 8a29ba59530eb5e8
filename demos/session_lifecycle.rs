//! # Session Lifecycle Example
//!
//! Walks one user through two app launches against an in-process loopback
//! server:
//!
//! 1. **First launch**: nothing stored, the user signs in, the realtime channel
//!    connects and the server greets it.
//! 2. **Second launch**: the token persisted by the first launch is restored,
//!    resolved into an identity and the channel reconnects on its own. The
//!    user then logs out and the channel disconnects.
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=questlink_session=debug cargo run --example session_lifecycle
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use questlink_session::error::Result;
use questlink_session::protocol::ConnectRequest;
use questlink_session::storage::FileStorage;
use questlink_session::{
    ChannelEvent, Connector, CredentialStore, Identity, IdentityFetcher, RuntimeConfig,
    SessionError, SessionRuntime, Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A loopback connector standing in for the realtime server
// ─────────────────────────────────────────────────────────────────────

/// Client half of one loopback connection.
struct LoopbackTransport {
    rx: mpsc::UnboundedReceiver<String>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<()> {
        self.log
            .lock()
            .map_err(|e| SessionError::TransportSend(e.to_string()))?
            .push(message);
        Ok(())
    }

    // Cancel-safe: `UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

/// Accepts only `demo-token` and greets every connection.
#[derive(Clone, Default)]
struct LoopbackConnector {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>> {
        if request.auth_header.as_str() != "Bearer demo-token" {
            return Err(SessionError::AuthRejected("unknown token".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(format!("welcome, {}", request.user_id))
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        // Keep the server half alive for as long as the client reads.
        tokio::spawn(async move {
            tx.closed().await;
        });
        Ok(Box::new(LoopbackTransport {
            rx,
            log: Arc::clone(&self.log),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: An identity fetcher backed by a fixed user table
// ─────────────────────────────────────────────────────────────────────

struct DirectoryFetcher;

#[async_trait]
impl IdentityFetcher for DirectoryFetcher {
    async fn fetch_identity(&self, locale: &str, token: &str) -> Result<Option<Identity>> {
        tracing::info!(%locale, "directory lookup");
        Ok((token == "demo-token").then(|| {
            Identity::new("u-ada").with_profile_field("displayName", "Ada Lovelace")
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Two launches sharing one storage directory
// ─────────────────────────────────────────────────────────────────────

async fn wait_for_connected(events: &mut mpsc::Receiver<ChannelEvent>) -> Option<()> {
    while let Some(event) = events.recv().await {
        tracing::info!(?event, "channel event");
        match event {
            ChannelEvent::Message(text) => {
                tracing::info!("server says: {text}");
                return Some(());
            }
            ChannelEvent::Failed { .. } => return None,
            _ => {}
        }
    }
    None
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let data_dir = tempfile::tempdir()?;
    let connector = LoopbackConnector::default();
    let config = RuntimeConfig::new("loopback://realtime").with_locale("en");

    // ── First launch: sign in ───────────────────────────────────────
    {
        let store = CredentialStore::new(FileStorage::new(data_dir.path()));
        let (mut runtime, mut events) =
            SessionRuntime::start(store, DirectoryFetcher, connector.clone(), config.clone());

        let mut phase = runtime.bootstrap().subscribe();
        phase.wait_for(|phase| !phase.is_loading()).await?;
        tracing::info!(session = ?runtime.session(), "first launch ready");

        runtime
            .store()
            .sign_in(
                "demo-token",
                Identity::new("u-ada").with_profile_field("displayName", "Ada Lovelace"),
            )
            .await;
        if wait_for_connected(&mut events).await.is_none() {
            return Err("channel did not connect on first launch".into());
        }

        runtime.shutdown().await;
    }

    // ── Second launch: restore, then log out ────────────────────────
    let store = CredentialStore::new(FileStorage::new(data_dir.path()));
    let (mut runtime, mut events) =
        SessionRuntime::start(store, DirectoryFetcher, connector.clone(), config);

    if wait_for_connected(&mut events).await.is_none() {
        return Err("channel did not reconnect on second launch".into());
    }
    tracing::info!(
        session = ?runtime.session(),
        connection = ?runtime.connection(),
        "restored session"
    );

    runtime.store().logout().await;
    while let Some(event) = events.recv().await {
        tracing::info!(?event, "channel event");
        if matches!(event, ChannelEvent::Disconnected { .. }) {
            break;
        }
    }

    runtime.shutdown().await;

    let frames = connector.log.lock().map(|log| log.len()).unwrap_or_default();
    tracing::info!("Done: client sent {frames} frame(s) across both launches.");
    Ok(())
}
