//! Core module containing the types shared by every layer of the engine

pub mod entity;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod snapshot;

pub use entity::{CacheEntry, EntityId, Provenance, Topic, ValidatorToken, Version};
pub use error::{
    CommandError, ConfigError, ConnectionError, FetchError, SessionError, SyncError,
    TransportError,
};
pub use events::{EventBus, EventEnvelope, SyncEvent, TurnSource};
pub use lifecycle::{HostEvent, HostLifecycle, HostSignal};
pub use snapshot::{GameView, Phase, Seat};
