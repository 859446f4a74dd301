//! The synchronization client facade
//!
//! [`SyncClient`] wires the engine together and owns its background tasks:
//!
//! ```text
//!                 ┌────────────────────┐  ManagerEvent   ┌────────┐
//! Connector ────▶ │ ConnectionManager  │ ──────────────▶ │ router │
//!                 └────────────────────┘                 └───┬────┘
//!                      ▲ subscribe/command                   │ state_update
//!                      │                                     ▼
//! SyncClient::submit ──┴── OptimisticCoordinator ──▶ StateCache ──▶ EventBus
//!                                    │                    ▲           │
//!                                    └──▶ Resynchronizer ─┘   TurnDetector
//! ```
//!
//! Build one with [`SyncClientBuilder`]:
//!
//! ```rust,ignore
//! let client = SyncClient::builder()
//!     .with_config(SyncConfig::from_yaml_file("sync.yaml")?)
//!     .with_bearer_token(session_token)
//!     .build()?;
//!
//! client.connect();
//! client.load(42).await?;
//! let _subscription = client.subscribe(42);
//! client.submit(Mutation::bid(42, 3)).await?;
//! ```

pub mod builder;
pub mod status;

pub use builder::SyncClientBuilder;
pub use status::SyncStatus;

use crate::cache::{RefreshOutcome, Resynchronizer, StateCache};
use crate::config::SyncConfig;
use crate::connection::{ConnectionHandle, ConnectionStatus, ManagerEvent};
use crate::core::entity::{CacheEntry, EntityId, Topic};
use crate::core::error::{CommandError, FetchError};
use crate::core::events::{EventBus, SyncEvent};
use crate::core::snapshot::Seat;
use crate::http::CommandReceipt;
use crate::mutation::{Mutation, OptimisticCoordinator};
use crate::protocol::ServerFrame;
use crate::subscription::{FrameSink, Subscription, SubscriptionTracker};
use crate::turn::TurnDetector;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A running synchronization engine
///
/// Dropping the client stops the connection and every background task.
pub struct SyncClient {
    config: SyncConfig,
    events: EventBus,
    cache: StateCache,
    tracker: SubscriptionTracker,
    connection: ConnectionHandle,
    resync: Resynchronizer,
    coordinator: OptimisticCoordinator,
    turns: TurnDetector,
    status: SyncStatus,
    tasks: Vec<JoinHandle<()>>,
    resync_task: ResyncTask,
}

/// The post-handshake resynchronization in flight, if any
type ResyncTask = Arc<Mutex<Option<JoinHandle<()>>>>;

impl SyncClient {
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder::new()
    }

    /// Ask for the live connection
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Close the live connection; no reconnect is scheduled
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Declare interest in an entity's live updates
    ///
    /// Turn detection starts from the cached snapshot, if any. Dropping the
    /// handle withdraws the interest, and turn detection stops with the
    /// last one.
    pub fn subscribe(&self, entity_id: EntityId) -> Subscription {
        self.subscribe_as(entity_id, None)
    }

    /// Like [`subscribe`](Self::subscribe), with the viewer's seat pinned
    pub fn subscribe_as(&self, entity_id: EntityId, seat: Option<Seat>) -> Subscription {
        self.turns.watch(entity_id, seat);
        let sink: Arc<dyn FrameSink> = Arc::new(self.connection.clone());
        let turns = self.turns.clone();
        Subscription::open(Topic::game(entity_id), self.tracker.clone(), sink)
            .on_last_release(move || turns.unwatch(entity_id))
    }

    /// Load an entity, conditionally when it is already cached
    pub async fn load(&self, entity_id: EntityId) -> Result<CacheEntry, FetchError> {
        self.fetch(entity_id, false).await?;
        self.cache
            .get(entity_id)
            .ok_or(FetchError::NotFound { entity_id })
    }

    /// Refetch an entity in full
    pub async fn refresh(&self, entity_id: EntityId) -> Result<RefreshOutcome, FetchError> {
        self.fetch(entity_id, true).await
    }

    async fn fetch(&self, entity_id: EntityId, force: bool) -> Result<RefreshOutcome, FetchError> {
        match self.resync.refresh(entity_id, force).await {
            Ok(outcome) => {
                self.status.set_global_error(None);
                Ok(outcome)
            }
            Err(e) => {
                self.status
                    .set_global_error(Some(format!("failed to load game {}: {}", entity_id, e)));
                Err(e)
            }
        }
    }

    /// Apply a mutation optimistically and send it to the server
    ///
    /// On failure the cache is rolled back and the error is both returned
    /// and shown in the sync-error slot.
    pub async fn submit(&self, mutation: Mutation) -> Result<CommandReceipt, CommandError> {
        let result = self.coordinator.submit(mutation).await;
        match &result {
            Ok(_) => self.status.set_mutation_error(None),
            Err(e) => self.status.set_mutation_error(Some(e.to_string())),
        }
        result
    }

    /// The entry to render for `entity_id` (may be optimistic)
    pub fn get(&self, entity_id: EntityId) -> Option<CacheEntry> {
        self.cache.get(entity_id)
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn turns(&self) -> &TurnDetector {
        &self.turns
    }

    /// The user-visible sync error, if any
    pub fn sync_error(&self) -> Option<String> {
        self.status.current()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Disconnect and stop every background task
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.connection.shutdown();
        self.coordinator.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        if let Some(task) = self.resync_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Everything the frame router writes to
#[derive(Clone)]
struct Router {
    cache: StateCache,
    tracker: SubscriptionTracker,
    resync: Resynchronizer,
    turns: TurnDetector,
    status: SyncStatus,
    events: EventBus,
    resync_task: ResyncTask,
}

impl Router {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<ManagerEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                ManagerEvent::Established { epoch, .. } => self.resynchronize(epoch),
                ManagerEvent::Frame(frame) => self.route(frame),
                ManagerEvent::Failed(error) => {
                    tracing::error!(code = error.error_code(), error = %error, "live connection failed");
                    self.status.set_global_error(Some(error.to_string()));
                }
            }
        }
        tracing::debug!("frame router stopped");
    }

    fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::StateUpdate {
                topic,
                version,
                payload,
            } => {
                self.cache.apply_push(topic.entity_id(), version, payload);
            }
            ServerFrame::YourTurn { entity_id, .. } => {
                self.turns.on_hint(entity_id);
            }
            ServerFrame::Invalidated { entity_id } => self.turns.on_invalidated(entity_id),
            ServerFrame::Error { code, message, .. } => {
                tracing::warn!(%code, %message, "server reported an error");
                self.events
                    .publish(SyncEvent::ServerError { code, message });
            }
            ServerFrame::Ack { message } => tracing::debug!(%message, "server ack"),
            frame => tracing::debug!(kind = frame.kind(), "unrouted frame"),
        }
    }

    /// Pushes sent while disconnected are lost: refetch every subscribed entity
    ///
    /// A newer connection supersedes a resynchronization still in flight.
    fn resynchronize(&self, epoch: u64) {
        self.status.set_global_error(None);

        let entity_ids: Vec<EntityId> = self
            .tracker
            .topics()
            .iter()
            .map(Topic::entity_id)
            .collect();
        if entity_ids.is_empty() {
            return;
        }

        let resync = self.resync.clone();
        let status = self.status.clone();
        let task = tokio::spawn(async move {
            let failures = resync.resync_all(&entity_ids).await;
            if let Some((entity_id, error)) = failures.first() {
                tracing::warn!(epoch, failed = failures.len(), "resynchronization incomplete");
                status.set_global_error(Some(format!(
                    "failed to resynchronize game {}: {}",
                    entity_id, error
                )));
            }
        });

        let mut slot = self.resync_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(superseded) = slot.replace(task) {
            superseded.abort();
        }
    }
}
