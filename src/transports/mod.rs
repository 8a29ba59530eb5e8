//! Realtime transport implementations.
//!
//! Concrete [`Connector`](crate::Connector) and [`Transport`](crate::Transport)
//! implementations live behind feature gates:
//!
//! | Feature                | Connector               | Transport              |
//! |------------------------|-------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketConnector`]  | [`WebSocketTransport`] |

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
