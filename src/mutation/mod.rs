//! Optimistic mutation coordinator
//!
//! A user command is reflected in the cache before the server confirms it:
//!
//! 1. the current entry is kept aside as `previous`,
//! 2. a speculative entry (provenance `optimistic`, base = previous version)
//!    replaces it and the pending-action latch is set,
//! 3. the command is dispatched (live connection when open, HTTP otherwise),
//! 4. on failure `previous` is restored verbatim, on success nothing is
//!    corrected: the authoritative echo supersedes the speculative entry.
//!
//! If the echo never arrives, a confirmation watchdog refetches the entity
//! after `confirm_timeout`.
//!
//! Commands for the same entity are serialized so speculative guesses never
//! stack on top of an unresolved one.

pub mod dispatch;

pub use dispatch::{CommandDispatch, RoutedDispatch};

use crate::cache::{Resynchronizer, StateCache};
use crate::core::entity::{CacheEntry, EntityId};
use crate::core::error::CommandError;
use crate::core::snapshot::GameView;
use crate::http::CommandReceipt;
use crate::protocol::GameAction;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One user command against one entity
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub entity_id: EntityId,
    pub action: GameAction,
}

impl Mutation {
    pub fn new(entity_id: EntityId, action: GameAction) -> Self {
        Self { entity_id, action }
    }

    pub fn bid(entity_id: EntityId, bid: u8) -> Self {
        Self::new(entity_id, GameAction::Bid { bid })
    }

    pub fn trump(entity_id: EntityId, trump: impl Into<String>) -> Self {
        Self::new(
            entity_id,
            GameAction::Trump {
                trump: trump.into(),
            },
        )
    }

    pub fn play(entity_id: EntityId, card: impl Into<String>) -> Self {
        Self::new(entity_id, GameAction::Play { card: card.into() })
    }

    pub fn ready(entity_id: EntityId, is_ready: bool) -> Self {
        Self::new(entity_id, GameAction::Ready { is_ready })
    }

    /// The anticipated effect of the command on a cached payload
    ///
    /// Structural guesses only. Fields that are missing are left alone, and
    /// nothing here decides whether the command is legal.
    pub fn speculate(&self, payload: &Value) -> Value {
        let mut next = payload.clone();
        let seat = GameView::new(payload).viewer_seat();

        match &self.action {
            GameAction::Bid { bid } => {
                if let Some(slot) = seat.and_then(|s| {
                    next.pointer_mut(&format!("/game/phase/data/bids/{}", s))
                }) {
                    *slot = json!(bid);
                }
            }
            GameAction::Trump { trump } => {
                if let Some(round) = next
                    .pointer_mut("/game/phase/data/round")
                    .and_then(Value::as_object_mut)
                {
                    round.insert("trump".to_string(), json!(trump));
                }
            }
            GameAction::Play { card } => {
                let card = json!(card);
                if let Some(hand) = next.pointer_mut("/viewer/hand").and_then(Value::as_array_mut) {
                    hand.retain(|c| *c != card);
                }
                if let Some(playable) = next
                    .pointer_mut("/game/phase/data/playable")
                    .and_then(Value::as_array_mut)
                {
                    playable.retain(|c| *c != card);
                }
                if let (Some(seat), Some(trick)) = (
                    seat,
                    next.pointer_mut("/game/phase/data/current_trick")
                        .and_then(Value::as_array_mut),
                ) {
                    trick.push(json!([seat, card]));
                }
            }
            GameAction::Ready { .. } => {}
        }

        next
    }
}

/// Applies mutations optimistically and keeps the cache convergent
#[derive(Clone)]
pub struct OptimisticCoordinator {
    cache: StateCache,
    dispatch: Arc<dyn CommandDispatch>,
    resync: Resynchronizer,
    command_timeout: Duration,
    confirm_timeout: Duration,
    gates: Arc<Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>>>,
    watchdogs: Arc<Mutex<HashMap<EntityId, JoinHandle<()>>>>,
}

impl OptimisticCoordinator {
    pub fn new(
        cache: StateCache,
        dispatch: Arc<dyn CommandDispatch>,
        resync: Resynchronizer,
        command_timeout: Duration,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            dispatch,
            resync,
            command_timeout,
            confirm_timeout,
            gates: Arc::new(Mutex::new(HashMap::new())),
            watchdogs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn gate(&self, entity_id: EntityId) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates.retain(|id, gate| *id == entity_id || Arc::strong_count(gate) > 1);
        gates.entry(entity_id).or_default().clone()
    }

    /// Apply `mutation` speculatively, dispatch it, and roll back on failure
    ///
    /// Waits for any earlier mutation of the same entity to resolve first.
    /// The entity must already be cached.
    pub async fn submit(&self, mutation: Mutation) -> Result<CommandReceipt, CommandError> {
        let entity_id = mutation.entity_id;
        let gate = self.gate(entity_id);
        let _turn = gate.lock().await;

        let previous = self
            .cache
            .begin_optimistic(entity_id, |payload| mutation.speculate(payload))?;

        let dispatched = tokio::time::timeout(
            self.command_timeout,
            self.dispatch.dispatch(entity_id, &mutation.action, &previous),
        )
        .await
        .unwrap_or(Err(CommandError::timeout(self.command_timeout)));

        match dispatched {
            Ok(receipt) => {
                tracing::debug!(
                    entity_id,
                    command = mutation.action.command_name(),
                    version = ?receipt.version,
                    "command accepted"
                );
                self.arm_watchdog(previous);
                Ok(receipt)
            }
            Err(e) => {
                tracing::info!(
                    entity_id,
                    command = mutation.action.command_name(),
                    error = %e,
                    "command failed, rolling back"
                );
                self.cache.rollback(&previous);
                Err(e)
            }
        }
    }

    /// Refetch the entity if its speculative entry outlives `confirm_timeout`
    fn arm_watchdog(&self, previous: CacheEntry) {
        let entity_id = previous.entity_id;
        let cache = self.cache.clone();
        let resync = self.resync.clone();
        let delay = self.confirm_timeout;

        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !is_unconfirmed(&cache, &previous) {
                return;
            }

            tracing::info!(entity_id, "no authoritative echo, refetching");
            if let Err(e) = resync.refresh(entity_id, true).await {
                tracing::warn!(entity_id, error = %e, "confirmation refetch failed");
                return;
            }

            // The server is still at the base version: every guess stacked
            // on it was wrong, including any this one was derived from.
            if is_unconfirmed(&cache, &previous) {
                cache.revert_to_authoritative(entity_id, previous.base_version());
            }
        });

        let mut watchdogs = self.watchdogs.lock().unwrap_or_else(|e| e.into_inner());
        watchdogs.retain(|_, handle| !handle.is_finished());
        if let Some(stale) = watchdogs.insert(entity_id, watchdog) {
            stale.abort();
        }
    }

    /// Stop all confirmation watchdogs
    pub fn shutdown(&self) {
        let mut watchdogs = self.watchdogs.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in watchdogs.drain() {
            handle.abort();
        }
    }
}

fn is_unconfirmed(cache: &StateCache, previous: &CacheEntry) -> bool {
    cache
        .get(previous.entity_id)
        .is_some_and(|current| current.is_optimistic() && current.base_version() == previous.base_version())
}
