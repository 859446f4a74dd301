//! Connection lifecycle: handshake, reconnection with backoff, liveness and
//! host suspend/resume handling
//!
//! The lifecycle is split in two layers:
//!
//! - [`machine::ConnectionMachine`] is a synchronous state machine. It
//!   consumes [`machine::Input`]s, every one of them tagged with the epoch of
//!   the attempt it came from, and answers with [`machine::Effect`]s.
//! - [`manager::ConnectionManager`] is the tokio actor that owns the
//!   transport, runs the timers and executes those effects.

pub mod backoff;
pub mod machine;
pub mod manager;

pub use backoff::ReconnectState;
pub use machine::{ConnectionMachine, Effect, Epoch, Input};
pub use manager::{ConnectionHandle, ConnectionManager, ManagerEvent};

use serde::{Deserialize, Serialize};
use std::fmt;

/// User-visible connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Snapshot published to status watchers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reconnect attempts since the last successful handshake
    pub attempt: u32,
    pub epoch: Epoch,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt: 0,
            epoch: 0,
        }
    }
}
