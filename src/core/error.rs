//! Typed error handling for the synchronization engine
//!
//! Errors are grouped by the component that produces them so callers can
//! react to a category rather than to a message string.
//!
//! # Error Categories
//!
//! - [`TransportError`]: the live connection failed (recovered by reconnection)
//! - [`ConnectionError`]: the connection lifecycle gave up or timed out
//! - [`CommandError`]: the server refused or never answered a command
//! - [`FetchError`]: a snapshot fetch failed (cache keeps its last good value)
//! - [`SessionError`]: credentials are gone and the user must sign in again
//! - [`ConfigError`]: configuration parsing and validation
//!
//! # Example
//!
//! ```rust,ignore
//! match client.submit(mutation).await {
//!     Ok(()) => {}
//!     Err(SyncError::Command(CommandError::Conflict { .. })) => {
//!         // cache already rolled back, the next push brings the fresh state
//!     }
//!     Err(e) => eprintln!("{} ({})", e, e.error_code()),
//! }
//! ```

use crate::core::entity::EntityId;
use std::time::Duration;
use thiserror::Error;

/// The main error type of the engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Internal engine errors (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Transport(e) => e.error_code(),
            SyncError::Connection(e) => e.error_code(),
            SyncError::Command(e) => e.error_code(),
            SyncError::Fetch(e) => e.error_code(),
            SyncError::Session(e) => e.error_code(),
            SyncError::Config(_) => "CONFIG_ERROR",
            SyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the condition cannot be healed by retrying
    pub fn is_terminal(&self) -> bool {
        match self {
            SyncError::Session(_) => true,
            SyncError::Connection(ConnectionError::AttemptsExhausted { .. }) => true,
            _ => false,
        }
    }
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Failures of the underlying bidirectional channel
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Failed to open connection: {0}")]
    Connect(String),

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Failed to receive frame: {0}")]
    Receive(String),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connect(_) => "TRANSPORT_CONNECT_FAILED",
            TransportError::Send(_) => "TRANSPORT_SEND_FAILED",
            TransportError::Receive(_) => "TRANSPORT_RECEIVE_FAILED",
            TransportError::Closed => "TRANSPORT_CLOSED",
        }
    }
}

// =============================================================================
// Connection Errors
// =============================================================================

/// Failures of the connection lifecycle
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("Server did not acknowledge the handshake within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("No traffic from server for {timeout_ms}ms")]
    Stalled { timeout_ms: u64 },

    #[error("Gave up reconnecting after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection manager has shut down")]
    Shutdown,
}

impl ConnectionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectionError::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            ConnectionError::Stalled { .. } => "CONNECTION_STALLED",
            ConnectionError::AttemptsExhausted { .. } => "RECONNECT_EXHAUSTED",
            ConnectionError::NotConnected => "NOT_CONNECTED",
            ConnectionError::Shutdown => "CONNECTION_SHUTDOWN",
        }
    }
}

// =============================================================================
// Command Errors
// =============================================================================

/// Reasons a command was not applied by the server
///
/// Every variant triggers a rollback of the optimistic write. None of them
/// is retried automatically.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// The server considered the command invalid (bad input, precondition)
    #[error("Command rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Command forbidden: {message}")]
    Forbidden { message: String },

    /// The command was issued against an outdated version
    #[error("Version conflict: {message}")]
    Conflict { message: String },

    #[error("Entity {entity_id} is not loaded")]
    NotLoaded { entity_id: EntityId },

    #[error("No response to command within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Command could not be delivered: {0}")]
    Delivery(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl CommandError {
    pub fn timeout(after: Duration) -> Self {
        CommandError::Timeout {
            timeout_ms: saturating_millis(after),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            CommandError::Rejected { .. } => "COMMAND_REJECTED",
            CommandError::Forbidden { .. } => "COMMAND_FORBIDDEN",
            CommandError::Conflict { .. } => "VERSION_CONFLICT",
            CommandError::NotLoaded { .. } => "ENTITY_NOT_LOADED",
            CommandError::Timeout { .. } => "COMMAND_TIMEOUT",
            CommandError::Delivery(_) => "COMMAND_DELIVERY_FAILED",
            CommandError::Server { .. } => "COMMAND_SERVER_ERROR",
            CommandError::Session(e) => e.error_code(),
        }
    }
}

// =============================================================================
// Fetch Errors
// =============================================================================

/// Failures of a snapshot fetch
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Snapshot request failed with status {status}")]
    Status { status: u16 },

    #[error("Entity {entity_id} not found")]
    NotFound { entity_id: EntityId },

    #[error("Snapshot fetch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed snapshot: {0}")]
    Decode(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl FetchError {
    pub fn timeout(after: Duration) -> Self {
        FetchError::Timeout {
            timeout_ms: saturating_millis(after),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "FETCH_NETWORK_ERROR",
            FetchError::Status { .. } => "FETCH_FAILED",
            FetchError::NotFound { .. } => "ENTITY_NOT_FOUND",
            FetchError::Timeout { .. } => "FETCH_TIMEOUT",
            FetchError::Decode(_) => "FETCH_DECODE_ERROR",
            FetchError::Session(e) => e.error_code(),
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Session Errors
// =============================================================================

/// The user's credentials are no longer accepted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("Session expired, sign in again")]
    Expired,

    #[error("Could not obtain a connection token: {0}")]
    TokenUnavailable(String),
}

impl SessionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::Expired => "SESSION_EXPIRED",
            SessionError::TokenUnavailable(_) => "TOKEN_UNAVAILABLE",
        }
    }
}

// =============================================================================
// Config Errors
// =============================================================================

/// Errors related to configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_delegate_to_category() {
        let err: SyncError = CommandError::Conflict {
            message: "stale".into(),
        }
        .into();
        assert_eq!(err.error_code(), "VERSION_CONFLICT");

        let err: SyncError = TransportError::Closed.into();
        assert_eq!(err.error_code(), "TRANSPORT_CLOSED");

        let err: SyncError = ConfigError::Invalid("x".into()).into();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_session_error_code_survives_wrapping() {
        let err = CommandError::from(SessionError::Expired);
        assert_eq!(err.error_code(), "SESSION_EXPIRED");

        let err = FetchError::from(SessionError::Expired);
        assert_eq!(err.error_code(), "SESSION_EXPIRED");
    }

    #[test]
    fn test_terminal_errors() {
        assert!(SyncError::from(SessionError::Expired).is_terminal());
        assert!(SyncError::from(ConnectionError::AttemptsExhausted { attempts: 10 }).is_terminal());
        assert!(!SyncError::from(ConnectionError::HandshakeTimeout { timeout_ms: 10 }).is_terminal());
        assert!(!SyncError::from(FetchError::Timeout { timeout_ms: 10 }).is_terminal());
    }

    #[test]
    fn test_timeouts_report_whole_milliseconds() {
        assert_eq!(
            CommandError::timeout(Duration::from_millis(1500)),
            CommandError::Timeout { timeout_ms: 1500 }
        );
        assert_eq!(
            FetchError::timeout(Duration::MAX),
            FetchError::Timeout { timeout_ms: u64::MAX }
        );
    }

    #[test]
    fn test_display_messages() {
        let err = ConnectionError::AttemptsExhausted { attempts: 3 };
        assert!(err.to_string().contains("3 attempts"));

        let err = CommandError::NotLoaded { entity_id: 9 };
        assert_eq!(err.to_string(), "Entity 9 is not loaded");
    }
}
