//! Event fan-out for synchronization observers
//!
//! The EventBus decouples the engine's writers (connection manager, cache,
//! coordinator, turn detector) from whatever renders their effects. It uses
//! `tokio::sync::broadcast`, so every subscriber sees every event published
//! after it subscribed, and slow subscribers are told they lagged instead of
//! slowing the engine down.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager ──┐
//! StateCache ─────────┼──▶ EventBus::publish() ──▶ broadcast ──▶ UI observers
//! TurnDetector ───────┘                                      ──▶ entity_stream(id)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let bus = EventBus::new(1024);
//! let mut updates = bus.entity_stream(42);
//!
//! while let Some(envelope) = updates.next().await {
//!     println!("{:?}", envelope.event);
//! }
//! ```

use crate::connection::ConnectionStatus;
use crate::core::entity::{EntityId, Provenance, Version};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Why a turn notification fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    /// Derived from an authoritative snapshot transition
    Snapshot,
    /// Forwarded from a server `your_turn` hint
    Hint,
}

/// Everything the engine tells its observers about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Connection status or attempt counter changed
    ConnectionChanged {
        status: ConnectionStatus,
        attempt: u32,
    },
    /// A cache entry was replaced
    EntityUpdated {
        entity_id: EntityId,
        version: Version,
        provenance: Provenance,
    },
    /// An optimistic entry was reverted to its previous value
    EntityRolledBack {
        entity_id: EntityId,
        version: Version,
    },
    /// It just became the viewer's turn
    TurnStarted {
        entity_id: EntityId,
        source: TurnSource,
    },
    /// A long-running wait was invalidated server-side
    WaitInvalidated { entity_id: Option<EntityId> },
    /// The server reported an error on the live connection
    ServerError { code: String, message: String },
    /// The user-visible sync error changed (`None` = cleared)
    SyncErrorChanged { error: Option<String> },
}

impl SyncEvent {
    /// Get the entity this event relates to (if any)
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            SyncEvent::EntityUpdated { entity_id, .. }
            | SyncEvent::EntityRolledBack { entity_id, .. }
            | SyncEvent::TurnStarted { entity_id, .. } => Some(*entity_id),
            SyncEvent::WaitInvalidated { entity_id } => *entity_id,
            SyncEvent::ConnectionChanged { .. }
            | SyncEvent::ServerError { .. }
            | SyncEvent::SyncErrorChanged { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::ConnectionChanged { .. } => "connection_changed",
            SyncEvent::EntityUpdated { .. } => "entity_updated",
            SyncEvent::EntityRolledBack { .. } => "entity_rolled_back",
            SyncEvent::TurnStarted { .. } => "turn_started",
            SyncEvent::WaitInvalidated { .. } => "wait_invalidated",
            SyncEvent::ServerError { .. } => "server_error",
            SyncEvent::SyncErrorChanged { .. } => "sync_error_changed",
        }
    }
}

/// Envelope wrapping an event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: SyncEvent,
}

impl EventEnvelope {
    pub fn new(event: SyncEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Broadcast-based event bus
///
/// Cheap to clone, every clone publishes to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    ///
    /// The capacity determines how many events can be buffered before
    /// slow receivers start losing events (lagged).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    ///
    /// Never blocks and never fails. Returns the number of receivers.
    pub fn publish(&self, event: SyncEvent) -> usize {
        tracing::trace!(kind = event.kind(), "publishing sync event");
        let envelope = EventEnvelope::new(event);
        // send() returns Err only if there are no receivers, which is fine
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Stream of the events concerning one entity
    ///
    /// Lagged notifications are skipped: a consumer that missed updates
    /// reads the cache, which already holds the latest version.
    pub fn entity_stream(
        &self,
        entity_id: EntityId,
    ) -> impl Stream<Item = EventEnvelope> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| async move {
            match item {
                Ok(envelope) if envelope.event.entity_id() == Some(entity_id) => Some(envelope),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!(entity_id, error = %e, "entity stream lagged");
                    None
                }
            }
        })
    }

    /// Get the current number of active subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
