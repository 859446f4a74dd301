//! Bidirectional text transport used by the connection manager
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. The
//! default connector speaks WebSocket through `tokio-tungstenite`;
//! [`in_memory::InMemoryConnector`] pairs the client with a scripted server
//! end for tests.

pub mod in_memory;
pub mod websocket;

pub use in_memory::{InMemoryConnector, ServerEnd};
pub use websocket::WebSocketConnector;

use crate::core::error::{SyncError, TransportError};
use async_trait::async_trait;

/// Something received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    /// A text frame to decode
    Text(String),
    /// Protocol-level keepalive traffic (ping/pong); proves liveness only
    Heartbeat,
}

/// One open connection
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next message, `None` once the peer closed the connection
    async fn recv(&mut self) -> Option<Result<TransportMessage, TransportError>>;

    async fn close(&mut self);
}

/// Opens transports
///
/// Errors that are [terminal](SyncError::is_terminal) (an expired session)
/// stop the reconnection loop; anything else is retried with backoff.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, SyncError>;
}
