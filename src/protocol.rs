//! Identity and auth framing for the realtime channel.
//!
//! The message schema carried over the channel belongs to the application;
//! this module only covers what the lifecycle manager itself needs:
//!
//! - [`AuthHeader`]: the `Authorization: Bearer <token>` value presented at
//!   connect time.
//! - [`ConnectRequest`]: everything a [`Connector`](crate::transport::Connector)
//!   needs to dial one attempt.
//! - [`ClientFrame`]: the control frames the client sends on its own behalf.

use serde::{Deserialize, Serialize};

/// Authorization header value derived from a session token.
///
/// Two headers are equal iff they were derived from the same token, which is
/// how the connection manager tells a credential change from a repeated call.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthHeader(String);

impl AuthHeader {
    /// Build a `Bearer <token>` header value.
    pub fn bearer(token: &str) -> Self {
        Self(format!("Bearer {token}"))
    }

    /// The full header value, e.g. `"Bearer abc"`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Never print the credential itself.
impl std::fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthHeader(Bearer ***)")
    }
}

/// Parameters for a single connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Endpoint of the realtime server.
    pub url: String,
    /// Authorization header to present during the handshake.
    pub auth_header: AuthHeader,
    /// Id of the authenticated user the channel belongs to.
    pub user_id: String,
}

/// Control frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on a fresh connection: binds the socket to a user.
    Identify {
        /// Authenticated user id.
        #[serde(rename = "userId")]
        user_id: String,
    },
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
    fn bearer_header_format() {
        let header = AuthHeader::bearer("abc.def");
        assert_eq!(header.as_str(), "Bearer abc.def");
    }

    #[test]
    fn headers_compare_by_token() {
        assert_eq!(AuthHeader::bearer("t1"), AuthHeader::bearer("t1"));
        assert_ne!(AuthHeader::bearer("t1"), AuthHeader::bearer("t2"));
    }

    #[test]
    fn debug_redacts_token() {
        let rendered = format!("{:?}", AuthHeader::bearer("secret-token"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn identify_frame_wire_format() {
        let frame = ClientFrame::Identify {
            user_id: "u1".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"identify","userId":"u1"}"#);
    }
}
