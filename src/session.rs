//! The credential store: the process-wide, persisted [`Session`] record.
//!
//! [`CredentialStore`] is a cheaply cloneable handle. Construct exactly one per
//! process and hand clones to the components that need it; there is no global
//! instance. Every mutation updates the in-memory record first (visible to
//! subscribers immediately) and then persists the durable fields through the
//! injected [`Storage`].
//!
//! # Example
//!
//! ```
//! # async fn example() {
//! use questlink_session::session::{CredentialStore, Identity};
//! use questlink_session::storage::MemoryStorage;
//!
//! let store = CredentialStore::new(MemoryStorage::new());
//! let mut changes = store.subscribe();
//!
//! store.hydrate().await;
//! store.sign_in("tok-1", Identity::new("u1")).await;
//!
//! let session = changes.current();
//! assert!(session.has_hydrated);
//! assert!(session.is_authenticated);
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::storage::Storage;

/// Storage key under which the durable session fields are kept.
pub const SESSION_STORAGE_KEY: &str = "auth-storage";

/// The authenticated user's profile, as returned by the identity endpoint.
///
/// Only `id` and `isAdmin` are interpreted; every other field of the payload
/// is kept verbatim in [`profile`](Identity::profile).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable user identifier.
    pub id: String,
    /// Whether the user holds administrator rights.
    #[serde(default)]
    pub is_admin: bool,
    /// Remaining profile fields (display name, avatar, level, ...).
    #[serde(flatten)]
    pub profile: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    /// Create an identity with the given id and no extra profile fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: false,
            profile: serde_json::Map::new(),
        }
    }

    /// Mark the identity as an administrator.
    #[must_use]
    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    /// Attach an extra profile field.
    #[must_use]
    pub fn with_profile_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.profile.insert(key.into(), value.into());
        self
    }
}

/// Snapshot of the authentication state.
///
/// `is_authenticated` is `true` only while `identity` is populated, and
/// `has_hydrated` never goes back to `false` once set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// Opaque bearer credential from the last successful login.
    pub token: Option<String>,
    /// Profile resolved from `token`.
    pub identity: Option<Identity>,
    /// `true` iff `identity` is populated.
    pub is_authenticated: bool,
    /// `true` once persisted state has been loaded (or found missing).
    pub has_hydrated: bool,
}

impl Session {
    /// The authenticated user's id, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.id.as_str())
    }
}

/// The durable subset of [`Session`].
///
/// Only the token survives a restart; the identity is re-fetched for it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSession {
    #[serde(default)]
    token: Option<String>,
}

struct StoreInner {
    state: watch::Sender<Session>,
    storage: Arc<dyn Storage>,
    hydration_started: AtomicBool,
    /// Serializes writes so the last persist always reflects the latest record.
    persist_lock: Mutex<()>,
}

/// Handle to the process-wide session record.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    /// Create a store over the given persistence backend. All fields start
    /// unset and `has_hydrated` is `false` until [`hydrate`](Self::hydrate)
    /// completes.
    pub fn new(storage: impl Storage) -> Self {
        Self::with_shared_storage(Arc::new(storage))
    }

    /// Create a store over an already shared backend.
    pub fn with_shared_storage(storage: Arc<dyn Storage>) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            inner: Arc::new(StoreInner {
                state,
                storage,
                hydration_started: AtomicBool::new(false),
                persist_lock: Mutex::new(()),
            }),
        }
    }

    /// Load the persisted token and mark the store as hydrated.
    ///
    /// Never fails: an unreadable or corrupt record is logged and treated as
    /// "no prior session". A token already set in memory (a login that raced
    /// ahead of hydration) takes precedence over the persisted one. Only the
    /// first call has any effect.
    pub async fn hydrate(&self) {
        if self.inner.hydration_started.swap(true, Ordering::AcqRel) {
            debug!("session hydration already performed, ignoring");
            return;
        }

        let persisted = match self.inner.storage.get(SESSION_STORAGE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedSession>(&raw) {
                Ok(persisted) => persisted,
                Err(e) => {
                    warn!(error = %e, "persisted session is corrupt, starting empty");
                    PersistedSession::default()
                }
            },
            Ok(None) => {
                debug!("no persisted session found");
                PersistedSession::default()
            }
            Err(e) => {
                warn!(error = %e, "failed to read persisted session, starting empty");
                PersistedSession::default()
            }
        };

        self.inner.state.send_modify(|session| {
            if session.token.is_none() {
                session.token = persisted.token;
            }
            session.is_authenticated = session.identity.is_some();
            session.has_hydrated = true;
        });

        let session = self.snapshot();
        info!(
            has_token = session.token.is_some(),
            is_authenticated = session.is_authenticated,
            "session hydrated"
        );
    }

    /// Record the identity resolved for the current token.
    pub async fn set_identity(&self, identity: Identity) {
        debug!(user_id = %identity.id, "session: identity set");
        self.inner.state.send_modify(|session| {
            session.identity = Some(identity);
            session.is_authenticated = true;
        });
        self.persist().await;
    }

    /// Store a freshly issued bearer token.
    pub async fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.inner.state.send_modify(|session| {
            session.token = Some(token);
        });
        debug!("session: token set");
        self.persist().await;
    }

    /// Store a token together with its identity in a single change.
    pub async fn sign_in(&self, token: impl Into<String>, identity: Identity) {
        let token = token.into();
        info!(user_id = %identity.id, "session: signed in");
        self.inner.state.send_modify(|session| {
            session.token = Some(token);
            session.identity = Some(identity);
            session.is_authenticated = true;
        });
        self.persist().await;
    }

    /// Clear the token and identity.
    ///
    /// Subscribers observe the cleared record before this method first
    /// suspends; the durable record is removed afterwards.
    pub async fn logout(&self) {
        info!("session: logout");
        self.inner.state.send_modify(|session| {
            session.token = None;
            session.identity = None;
            session.is_authenticated = false;
        });
        self.persist().await;
    }

    /// A copy of the current record.
    pub fn snapshot(&self) -> Session {
        self.inner.state.borrow().clone()
    }

    /// The current bearer token, if any.
    pub fn token(&self) -> Option<String> {
        self.inner.state.borrow().token.clone()
    }

    /// Returns `true` once hydration has completed.
    pub fn has_hydrated(&self) -> bool {
        self.inner.state.borrow().has_hydrated
    }

    /// Subscribe to changes. Dropping the returned value unsubscribes.
    pub fn subscribe(&self) -> SessionSubscription {
        SessionSubscription {
            rx: self.inner.state.subscribe(),
        }
    }

    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let session = self.snapshot();

        let result = match session.token {
            None => self.inner.storage.remove(SESSION_STORAGE_KEY).await,
            Some(token) => {
                let record = PersistedSession { token: Some(token) };
                match serde_json::to_string(&record) {
                    Ok(json) => self.inner.storage.set(SESSION_STORAGE_KEY, json).await,
                    Err(e) => Err(e.into()),
                }
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "failed to persist session");
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.snapshot();
        f.debug_struct("CredentialStore")
            .field("has_token", &session.token.is_some())
            .field("is_authenticated", &session.is_authenticated)
            .field("has_hydrated", &session.has_hydrated)
            .finish()
    }
}

/// A live view of the session record.
///
/// Changes may be coalesced: [`changed`](Self::changed) always yields the
/// latest record, never an intermediate one that was already superseded.
#[derive(Debug)]
pub struct SessionSubscription {
    rx: watch::Receiver<Session>,
}

impl SessionSubscription {
    /// The latest record, marking it as seen.
    pub fn current(&mut self) -> Session {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next change and return the latest record.
    ///
    /// Returns `None` once every [`CredentialStore`] handle has been dropped.
    pub async fn changed(&mut self) -> Option<Session> {
        self.rx.changed().await.ok()?;
        Some(self.current())
    }

    /// Wait until the store has hydrated and return the record at that point.
    ///
    /// Returns `None` if the store is dropped before hydrating.
    pub async fn wait_for_hydration(&mut self) -> Option<Session> {
        let session = self.rx.wait_for(|session| session.has_hydrated).await.ok()?;
        Some(session.clone())
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
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    /// Storage whose reads always fail.
    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(SessionError::Storage("disk unavailable".into()))
        }

        async fn set(&self, _key: &str, _value: String) -> Result<()> {
            Err(SessionError::Storage("disk unavailable".into()))
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Err(SessionError::Storage("disk unavailable".into()))
        }
    }

    fn persisted_json(token: &str) -> String {
        serde_json::to_string(&PersistedSession {
            token: Some(token.into()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn hydrate_empty_storage() {
        let store = CredentialStore::new(MemoryStorage::new());
        assert!(!store.has_hydrated());

        store.hydrate().await;

        let session = store.snapshot();
        assert!(session.has_hydrated);
        assert!(session.token.is_none());
        assert!(!session.is_authenticated);
    }

    #[tokio::test]
    async fn hydrate_restores_token_but_not_identity() {
        let storage = MemoryStorage::with_entry(SESSION_STORAGE_KEY, persisted_json("tok"));
        let store = CredentialStore::new(storage);
        store.hydrate().await;

        let session = store.snapshot();
        assert_eq!(session.token.as_deref(), Some("tok"));
        assert!(session.identity.is_none());
        assert!(!session.is_authenticated);
    }

    #[tokio::test]
    async fn sign_in_persists_only_the_token() {
        let storage = MemoryStorage::new();
        let store = CredentialStore::new(storage.clone());
        store.hydrate().await;
        store
            .sign_in("tok", Identity::new("u1").with_profile_field("displayName", "Ada"))
            .await;

        let raw = storage.get(SESSION_STORAGE_KEY).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, serde_json::json!({ "token": "tok" }));
    }

    #[tokio::test]
    async fn hydrate_corrupt_record_is_treated_as_empty() {
        let storage = MemoryStorage::with_entry(SESSION_STORAGE_KEY, "{not json");
        let store = CredentialStore::new(storage);
        store.hydrate().await;

        let session = store.snapshot();
        assert!(session.has_hydrated);
        assert!(session.token.is_none());
        assert!(session.identity.is_none());
    }

    #[tokio::test]
    async fn hydrate_read_failure_is_treated_as_empty() {
        let store = CredentialStore::new(BrokenStorage);
        store.hydrate().await;

        let session = store.snapshot();
        assert!(session.has_hydrated);
        assert!(session.token.is_none());
    }

    #[tokio::test]
    async fn hydration_flag_flips_exactly_once() {
        let storage = MemoryStorage::with_entry(SESSION_STORAGE_KEY, persisted_json("tok"));
        let store = CredentialStore::new(storage);
        let mut sub = store.subscribe();

        store.hydrate().await;
        let first = sub.changed().await.unwrap();
        assert!(first.has_hydrated);

        // A second hydration does not notify or overwrite anything.
        store.logout().await;
        store.hydrate().await;
        let session = sub.changed().await.unwrap();
        assert!(session.has_hydrated);
        assert!(session.token.is_none());
    }

    #[tokio::test]
    async fn logout_clears_record_and_storage() {
        let storage = MemoryStorage::new();
        let store = CredentialStore::new(storage.clone());
        store.hydrate().await;
        store.sign_in("tok", Identity::new("u1")).await;
        assert!(storage.get(SESSION_STORAGE_KEY).await.unwrap().is_some());

        let mut sub = store.subscribe();
        let logout = store.logout();
        // Not polled yet: nothing has changed.
        assert!(sub.current().is_authenticated);
        logout.await;

        let session = sub.current();
        assert!(!session.is_authenticated);
        assert!(session.token.is_none());
        assert!(storage.get(SESSION_STORAGE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn login_before_hydration_wins_over_persisted_token() {
        let storage = MemoryStorage::with_entry(SESSION_STORAGE_KEY, persisted_json("old"));
        let store = CredentialStore::new(storage);
        store.set_token("fresh").await;
        store.hydrate().await;
        assert_eq!(store.token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn persist_failure_keeps_in_memory_state() {
        let store = CredentialStore::new(BrokenStorage);
        store.hydrate().await;
        store.sign_in("tok", Identity::new("u1")).await;
        assert!(store.snapshot().is_authenticated);
    }

    #[tokio::test]
    async fn wait_for_hydration_resolves_after_hydrate() {
        let store = CredentialStore::new(MemoryStorage::new());
        let mut sub = store.subscribe();

        let hydrating = store.clone();
        tokio::spawn(async move { hydrating.hydrate().await });

        let session = sub.wait_for_hydration().await.unwrap();
        assert!(session.has_hydrated);
    }

    #[test]
    fn identity_keeps_unknown_profile_fields() {
        let json = r#"{"id":"u7","isAdmin":true,"displayName":"Ada","level":12}"#;
        let identity: Identity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.id, "u7");
        assert!(identity.is_admin);
        assert_eq!(identity.profile["displayName"], "Ada");
        assert_eq!(identity.profile["level"], 12);
    }

    #[test]
    fn identity_admin_defaults_to_false() {
        let identity: Identity = serde_json::from_str(r#"{"id":"u8"}"#).unwrap();
        assert!(!identity.is_admin);
        assert!(identity.profile.is_empty());
    }
}
