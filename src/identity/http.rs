//! [`IdentityFetcher`] over the platform's REST API using `reqwest`.
//!
//! Issues `GET {base_url}/users/me` with the bearer token and the requested
//! locale, and expects a `{ "data": <identity or null> }` envelope.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT_LANGUAGE, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::{Result, SessionError};
use crate::identity::IdentityFetcher;
use crate::protocol::AuthHeader;
use crate::session::Identity;

/// Default timeout for the identity request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Path of the "current user" endpoint, relative to the base URL.
const CURRENT_USER_PATH: &str = "users/me";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Identity>,
}

/// Fetches the current user from `{base_url}/users/me`.
#[derive(Debug, Clone)]
pub struct HttpIdentityFetcher {
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpIdentityFetcher {
    /// Create a fetcher for the API rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IdentityFetch`] if `base_url` is not a valid URL.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a fetcher that reuses an existing `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IdentityFetch`] if `base_url` is not a valid URL.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self> {
        // A trailing slash keeps `join` from replacing the last path segment.
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let endpoint = Url::parse(&base)
            .and_then(|url| url.join(CURRENT_USER_PATH))
            .map_err(|e| SessionError::IdentityFetch(format!("invalid base URL: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the request timeout. Defaults to **30 seconds**.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The resolved endpoint URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl IdentityFetcher for HttpIdentityFetcher {
    async fn fetch_identity(&self, locale: &str, token: &str) -> Result<Option<Identity>> {
        tracing::debug!(endpoint = %self.endpoint, locale, "fetching current identity");

        let response = self
            .http
            .get(self.endpoint.clone())
            .header(AUTHORIZATION, AuthHeader::bearer(token).as_str())
            .header(ACCEPT_LANGUAGE, locale)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SessionError::AuthRejected(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(SessionError::IdentityFetch(format!("HTTP {}", status.as_u16())));
        }

        let envelope: Envelope = response.json().await?;
        Ok(envelope.data)
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
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn endpoint_keeps_base_path() {
        let fetcher = HttpIdentityFetcher::new("https://api.example.com/v1").unwrap();
        assert_eq!(fetcher.endpoint().as_str(), "https://api.example.com/v1/users/me");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpIdentityFetcher::new("not a url").unwrap_err();
        assert!(matches!(err, SessionError::IdentityFetch(_)));
    }

    #[tokio::test]
    async fn fetch_sends_bearer_and_locale() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me"))
            .and(header("authorization", "Bearer tok-1"))
            .and(header("accept-language", "fr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "id": "u1", "isAdmin": false, "displayName": "Ada" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpIdentityFetcher::new(&server.uri()).unwrap();
        let identity = fetcher.fetch_identity("fr", "tok-1").await.unwrap().unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.profile["displayName"], "Ada");
    }

    #[tokio::test]
    async fn empty_payload_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": null })))
            .mount(&server)
            .await;

        let fetcher = HttpIdentityFetcher::new(&server.uri()).unwrap();
        assert!(fetcher.fetch_identity("en", "tok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let fetcher = HttpIdentityFetcher::new(&server.uri()).unwrap();
        let err = fetcher.fetch_identity("en", "expired").await.unwrap_err();
        assert!(err.is_auth_rejected());
    }

    #[tokio::test]
    async fn server_error_maps_to_identity_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpIdentityFetcher::new(&server.uri()).unwrap();
        let err = fetcher.fetch_identity("en", "tok").await.unwrap_err();
        assert!(matches!(err, SessionError::IdentityFetch(_)));
    }
}
