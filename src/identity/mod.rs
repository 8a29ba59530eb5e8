//! Resolving a bearer token into the authenticated [`Identity`].
//!
//! The bootstrap coordinator calls [`IdentityFetcher::fetch_identity`] exactly
//! once per hydration cycle. The fetcher belongs to the host's API client;
//! this crate only defines the seam, plus an optional HTTP implementation:
//!
//! | Feature         | Fetcher                  |
//! |-----------------|--------------------------|
//! | `identity-http` | [`HttpIdentityFetcher`]  |

#[cfg(feature = "identity-http")]
pub mod http;

#[cfg(feature = "identity-http")]
pub use http::HttpIdentityFetcher;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::Identity;

/// Fetches the profile that belongs to a bearer token.
///
/// # Implementing a fetcher
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use questlink_session::error::Result;
/// use questlink_session::identity::IdentityFetcher;
/// use questlink_session::session::Identity;
///
/// struct StaticFetcher;
///
/// #[async_trait]
/// impl IdentityFetcher for StaticFetcher {
///     async fn fetch_identity(&self, _locale: &str, token: &str) -> Result<Option<Identity>> {
///         Ok((token == "valid").then(|| Identity::new("u1")))
///     }
/// }
/// ```
#[async_trait]
pub trait IdentityFetcher: Send + Sync + 'static {
    /// Fetch the identity for `token`, localized for `locale`.
    ///
    /// Returns `Ok(None)` when the server answered successfully but without a
    /// profile payload.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthRejected`](crate::SessionError::AuthRejected)
    /// when the token is refused, or another error for network and server
    /// failures.
    async fn fetch_identity(&self, locale: &str, token: &str) -> Result<Option<Identity>>;
}

#[async_trait]
impl<F: IdentityFetcher + ?Sized> IdentityFetcher for Arc<F> {
    async fn fetch_identity(&self, locale: &str, token: &str) -> Result<Option<Identity>> {
        (**self).fetch_identity(locale, token).await
    }
}
