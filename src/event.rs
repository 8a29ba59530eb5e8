//! Events emitted by the realtime channel.
//!
//! These are the only observable side effects of the connection manager: it
//! never writes to the session record.

use uuid::Uuid;

/// A lifecycle or message event from the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connect attempt succeeded.
    Connected {
        /// Identity of the (singleton) channel object.
        channel_id: Uuid,
    },
    /// The live connection went away, or a connecting channel was torn down.
    Disconnected {
        /// Why the connection ended, if known.
        reason: Option<String>,
    },
    /// A connect attempt failed.
    ConnectError {
        /// Human-readable failure description.
        message: String,
    },
    /// A reconnect attempt is starting (1-based).
    Reconnecting {
        /// Number of this attempt since the last successful connect.
        attempt: u32,
    },
    /// The manager stopped retrying. Only a new auth-state change restarts it.
    Failed {
        /// Why retrying stopped.
        reason: String,
    },
    /// A text message arrived on the live connection.
    Message(String),
}
