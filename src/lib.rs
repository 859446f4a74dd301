//! # Realtime Sync
//!
//! A client-side synchronization engine that keeps a local view of
//! server-authoritative game state consistent across three channels that
//! deliver out of order: pushes over a live WebSocket connection, snapshot
//! fetches over HTTP, and optimistic edits made before the server confirms
//! a command.
//!
//! ## Features
//!
//! - **Resilient connection**: handshake timeout, bounded exponential
//!   reconnect backoff, liveness detection, and immediate reconnect when the
//!   host resumes
//! - **Epoch discipline**: late events from a retired connection attempt
//!   never touch the state
//! - **Upgrade-only cache**: entries are replaced only by strictly newer
//!   versions, whatever channel they arrive on
//! - **Conditional fetches**: ETag validators, `304 Not Modified` handling
//! - **Optimistic mutations**: speculative writes with exact rollback on
//!   failure and a confirmation watchdog on success
//! - **Turn notifications**: fired once per `false → true` edge
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use realtime::prelude::*;
//!
//! let client = SyncClient::builder()
//!     .with_config(SyncConfig::from_yaml_file("sync.yaml")?)
//!     .with_bearer_token(token)
//!     .build()?;
//!
//! client.connect();
//! client.load(42).await?;
//! let _subscription = client.subscribe(42);
//!
//! let mut updates = client.events().entity_stream(42);
//! client.submit(Mutation::bid(42, 3)).await?;
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod core;
pub mod http;
pub mod mutation;
pub mod protocol;
pub mod subscription;
pub mod transport;
pub mod turn;

/// Re-exports of commonly used types and traits
pub mod prelude {
    // === Core ===
    pub use crate::core::{
        entity::{CacheEntry, EntityId, Provenance, Topic, ValidatorToken, Version},
        error::{
            CommandError, ConfigError, ConnectionError, FetchError, SessionError, SyncError,
            TransportError,
        },
        events::{EventBus, EventEnvelope, SyncEvent, TurnSource},
        lifecycle::{HostEvent, HostLifecycle, HostSignal},
        snapshot::{GameView, Phase, Seat},
    };

    // === Engine ===
    pub use crate::cache::{ApplyOutcome, RefreshOutcome, Resynchronizer, StateCache};
    pub use crate::connection::{
        ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus, ManagerEvent,
    };
    pub use crate::mutation::{CommandDispatch, Mutation, OptimisticCoordinator, RoutedDispatch};
    pub use crate::subscription::{Subscription, SubscriptionTracker};
    pub use crate::turn::TurnDetector;

    // === Collaborators ===
    pub use crate::http::{
        CommandReceipt, CommandSubmitter, FetchOutcome, HttpApi, SnapshotFetcher, TokenProvider,
    };
    pub use crate::protocol::{ClientFrame, GameAction, PROTOCOL_VERSION, ServerFrame};
    pub use crate::transport::{Connector, InMemoryConnector, Transport, WebSocketConnector};

    // === Client ===
    pub use crate::client::{SyncClient, SyncClientBuilder};
    pub use crate::config::SyncConfig;

    // === External dependencies ===
    pub use anyhow::Result;
    pub use async_trait::async_trait;
    pub use futures::StreamExt;
}
