//! Session bootstrap: hydration → identity fetch → ready.
//!
//! [`BootstrapCoordinator`] waits for the [`CredentialStore`] to hydrate and,
//! if a token was restored, resolves it into an identity exactly once. The
//! coordinator never blocks app usage: whatever the fetch outcome, it ends in
//! [`BootstrapPhase::Ready`] and `is_loading()` turns `false`.
//!
//! ```text
//! Idle -> WaitingForHydration -> FetchingIdentity -> Ready
//!                            \________________________/
//!                                  (no token)
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::IdentityFetcher;
use crate::session::CredentialStore;

/// Locale sent with the identity request unless configured otherwise.
pub const DEFAULT_LOCALE: &str = "en";

/// Configuration for the [`BootstrapCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Locale forwarded to the identity fetcher. Defaults to `"en"`.
    pub locale: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

impl BootstrapConfig {
    /// Set the locale forwarded to the identity fetcher.
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }
}

/// Where the bootstrap currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapPhase {
    /// Constructed, not yet running.
    #[default]
    Idle,
    /// Waiting for the credential store to hydrate.
    WaitingForHydration,
    /// Resolving the restored token into an identity.
    FetchingIdentity,
    /// Done for this hydration cycle.
    Ready,
}

impl BootstrapPhase {
    /// `true` in every phase but [`Ready`](BootstrapPhase::Ready).
    ///
    /// `Idle` counts as loading: it only exists between construction and the
    /// first poll of [`BootstrapCoordinator::run`].
    pub fn is_loading(self) -> bool {
        self != BootstrapPhase::Ready
    }
}

/// Drives one hydration cycle of the session.
///
/// Cheap to clone; clones share the phase.
#[derive(Clone)]
pub struct BootstrapCoordinator {
    store: CredentialStore,
    fetcher: Arc<dyn IdentityFetcher>,
    locale: String,
    phase: Arc<watch::Sender<BootstrapPhase>>,
}

impl BootstrapCoordinator {
    /// Create a coordinator for `store` in the [`Idle`](BootstrapPhase::Idle) phase.
    pub fn new(
        store: CredentialStore,
        fetcher: impl IdentityFetcher,
        config: BootstrapConfig,
    ) -> Self {
        Self::with_shared_fetcher(store, Arc::new(fetcher), config)
    }

    /// Create a coordinator around an already shared fetcher.
    pub fn with_shared_fetcher(
        store: CredentialStore,
        fetcher: Arc<dyn IdentityFetcher>,
        config: BootstrapConfig,
    ) -> Self {
        let (phase, _) = watch::channel(BootstrapPhase::Idle);
        Self {
            store,
            fetcher,
            locale: config.locale,
            phase: Arc::new(phase),
        }
    }

    /// Run [`run`](Self::run) on a background task.
    pub fn spawn(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run().await })
    }

    /// Wait for hydration, then [`evaluate`](Self::evaluate).
    pub async fn run(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == BootstrapPhase::Idle {
                *phase = BootstrapPhase::WaitingForHydration;
                true
            } else {
                false
            }
        });

        let mut session = self.store.subscribe();
        if session.wait_for_hydration().await.is_none() {
            warn!("credential store went away before hydrating");
            return;
        }
        self.evaluate().await;
    }

    /// Act on the hydrated session.
    ///
    /// Only the first call after hydration does anything; later or concurrent
    /// calls return immediately, so at most one identity fetch happens per
    /// cycle. Calls made before hydration are ignored.
    pub async fn evaluate(&self) {
        if !self.store.has_hydrated() {
            debug!("bootstrap: store not hydrated yet");
            return;
        }

        let token = self.store.token();
        let claimed = self.phase.send_if_modified(|phase| match *phase {
            BootstrapPhase::Idle | BootstrapPhase::WaitingForHydration => {
                *phase = if token.is_some() {
                    BootstrapPhase::FetchingIdentity
                } else {
                    BootstrapPhase::Ready
                };
                true
            }
            BootstrapPhase::FetchingIdentity | BootstrapPhase::Ready => false,
        });
        if !claimed {
            debug!(phase = ?self.phase(), "bootstrap: already evaluated this cycle");
            return;
        }

        let Some(token) = token else {
            info!("bootstrap: no stored token, ready without identity fetch");
            return;
        };

        debug!(locale = %self.locale, "bootstrap: fetching identity");
        match self.fetcher.fetch_identity(&self.locale, &token).await {
            Ok(Some(identity)) => {
                // The store is the source of truth: drop responses for a
                // token that was replaced or cleared meanwhile.
                if self.store.token().as_deref() == Some(token.as_str()) {
                    info!(user_id = %identity.id, "bootstrap: identity resolved");
                    self.store.set_identity(identity).await;
                } else {
                    debug!("bootstrap: token changed during fetch, discarding identity");
                }
            }
            Ok(None) => {
                warn!("bootstrap: identity endpoint returned no payload");
            }
            Err(e) => {
                warn!(error = %e, "bootstrap: identity fetch failed, keeping prior session");
            }
        }

        self.phase.send_replace(BootstrapPhase::Ready);
    }

    /// Current phase.
    pub fn phase(&self) -> BootstrapPhase {
        *self.phase.borrow()
    }

    /// `true` until the cycle reaches [`Ready`](BootstrapPhase::Ready).
    pub fn is_loading(&self) -> bool {
        self.phase().is_loading()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<BootstrapPhase> {
        self.phase.subscribe()
    }
}

impl std::fmt::Debug for BootstrapCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapCoordinator")
            .field("phase", &self.phase())
            .field("locale", &self.locale)
            .finish()
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
    use crate::error::{Result, SessionError};
    use crate::session::{Identity, SESSION_STORAGE_KEY};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum Reply {
        Identity,
        Empty,
        Fail,
    }

    /// Fetcher that counts calls and optionally waits on a gate.
    struct CountingFetcher {
        reply: Reply,
        calls: Arc<AtomicUsize>,
        seen: Arc<StdMutex<Vec<(String, String)>>>,
        gate: Option<Arc<Notify>>,
    }

    impl CountingFetcher {
        fn new(reply: Reply) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let fetcher = Self {
                reply,
                calls: Arc::clone(&calls),
                seen: Arc::new(StdMutex::new(Vec::new())),
                gate: None,
            };
            (fetcher, calls)
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl IdentityFetcher for CountingFetcher {
        async fn fetch_identity(&self, locale: &str, token: &str) -> Result<Option<Identity>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((locale.to_string(), token.to_string()));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.reply {
                Reply::Identity => Ok(Some(Identity::new("u1"))),
                Reply::Empty => Ok(None),
                Reply::Fail => Err(SessionError::IdentityFetch("network unreachable".into())),
            }
        }
    }

    fn store_with_token(token: &str) -> CredentialStore {
        let record = serde_json::json!({ "token": token }).to_string();
        CredentialStore::new(MemoryStorage::with_entry(SESSION_STORAGE_KEY, record))
    }

    #[tokio::test]
    async fn no_token_is_ready_without_fetch() {
        let store = CredentialStore::new(MemoryStorage::new());
        let (fetcher, calls) = CountingFetcher::new(Reply::Identity);
        let coordinator = BootstrapCoordinator::new(store.clone(), fetcher, BootstrapConfig::default());
        assert!(coordinator.is_loading());

        let task = coordinator.spawn();
        store.hydrate().await;
        task.await.unwrap();

        assert_eq!(coordinator.phase(), BootstrapPhase::Ready);
        assert!(!coordinator.is_loading());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!store.snapshot().is_authenticated);
    }

    #[tokio::test]
    async fn token_is_resolved_into_identity() {
        let store = store_with_token("tok-1");
        let (fetcher, calls) = CountingFetcher::new(Reply::Identity);
        let seen = Arc::clone(&fetcher.seen);
        let coordinator = BootstrapCoordinator::new(
            store.clone(),
            fetcher,
            BootstrapConfig::default().with_locale("de"),
        );

        store.hydrate().await;
        coordinator.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap()[0], ("de".to_string(), "tok-1".to_string()));
        let session = store.snapshot();
        assert!(session.is_authenticated);
        assert_eq!(session.user_id(), Some("u1"));
        assert!(!coordinator.is_loading());
    }

    #[tokio::test]
    async fn repeated_evaluation_fetches_once() {
        let store = store_with_token("tok-1");
        let gate = Arc::new(Notify::new());
        let (fetcher, calls) = CountingFetcher::new(Reply::Identity);
        let coordinator = BootstrapCoordinator::new(
            store.clone(),
            fetcher.gated(Arc::clone(&gate)),
            BootstrapConfig::default(),
        );
        store.hydrate().await;

        let first = coordinator.spawn();
        // Let the first evaluation reach the fetcher.
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.phase(), BootstrapPhase::FetchingIdentity);
        assert!(coordinator.is_loading());

        tokio::join!(coordinator.evaluate(), coordinator.evaluate(), coordinator.run());

        gate.notify_one();
        first.await.unwrap();
        coordinator.evaluate().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.phase(), BootstrapPhase::Ready);
    }

    #[tokio::test]
    async fn evaluate_before_hydration_does_nothing() {
        let store = store_with_token("tok-1");
        let (fetcher, calls) = CountingFetcher::new(Reply::Identity);
        let coordinator = BootstrapCoordinator::new(store.clone(), fetcher, BootstrapConfig::default());

        coordinator.evaluate().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.phase(), BootstrapPhase::Idle);

        store.hydrate().await;
        coordinator.evaluate().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_payload_leaves_session_untouched() {
        let store = store_with_token("tok-1");
        let (fetcher, calls) = CountingFetcher::new(Reply::Empty);
        let coordinator = BootstrapCoordinator::new(store.clone(), fetcher, BootstrapConfig::default());

        store.hydrate().await;
        coordinator.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let session = store.snapshot();
        assert!(!session.is_authenticated);
        assert_eq!(session.token.as_deref(), Some("tok-1"));
        assert!(!coordinator.is_loading());
    }

    #[tokio::test]
    async fn fetch_failure_keeps_token_and_clears_loading() {
        let store = store_with_token("tok-1");
        let (fetcher, _calls) = CountingFetcher::new(Reply::Fail);
        let coordinator = BootstrapCoordinator::new(store.clone(), fetcher, BootstrapConfig::default());

        store.hydrate().await;
        let before = store.snapshot();
        coordinator.run().await;

        assert_eq!(store.snapshot(), before);
        assert_eq!(coordinator.phase(), BootstrapPhase::Ready);
    }

    #[tokio::test]
    async fn response_for_replaced_token_is_discarded() {
        let store = store_with_token("tok-1");
        let gate = Arc::new(Notify::new());
        let (fetcher, calls) = CountingFetcher::new(Reply::Identity);
        let coordinator = BootstrapCoordinator::new(
            store.clone(),
            fetcher.gated(Arc::clone(&gate)),
            BootstrapConfig::default(),
        );
        store.hydrate().await;

        let task = coordinator.spawn();
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        store.logout().await;
        gate.notify_one();
        task.await.unwrap();

        let session = store.snapshot();
        assert!(!session.is_authenticated);
        assert!(session.identity.is_none());
        assert_eq!(coordinator.phase(), BootstrapPhase::Ready);
    }

    #[tokio::test]
    async fn phases_are_observable() {
        let store = store_with_token("tok-1");
        let (fetcher, _calls) = CountingFetcher::new(Reply::Identity);
        let coordinator = BootstrapCoordinator::new(store.clone(), fetcher, BootstrapConfig::default());
        let mut phases = coordinator.subscribe();

        let task = coordinator.spawn();
        phases
            .wait_for(|phase| *phase == BootstrapPhase::WaitingForHydration)
            .await
            .unwrap();
        assert!(coordinator.is_loading());

        store.hydrate().await;
        phases
            .wait_for(|phase| *phase == BootstrapPhase::Ready)
            .await
            .unwrap();
        task.await.unwrap();
        assert!(store.snapshot().is_authenticated);
    }
}
