//! Version-reconciled state cache
//!
//! The cache is the single source of truth read by every consumer. It is
//! written only through the reconciliation functions below, which enforce
//! the upgrade-only rule: an incoming authoritative entry replaces the
//! cached one only when its version is strictly greater.
//!
//! Optimistic entries keep the version of the entry they were derived from
//! (their *base*), so any authoritative write newer than the base
//! supersedes them. While an optimistic entry is current, the slot also
//! keeps the last authoritative entry for readers that must not see
//! speculative data.

pub mod resync;

pub use resync::{RefreshOutcome, Resynchronizer};

use crate::core::entity::{CacheEntry, EntityId, Version};
use crate::core::error::CommandError;
use crate::core::events::{EventBus, SyncEvent};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Result of offering an authoritative entry to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First entry for this entity
    Created,
    /// Replaced an older entry (or superseded an optimistic one)
    Replaced { previous: Version },
    /// Not newer than what is cached, discarded
    Stale { current: Version },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, ApplyOutcome::Stale { .. })
    }
}

#[derive(Debug, Clone)]
struct Slot {
    current: CacheEntry,
    /// Equal to `current` unless `current` is optimistic
    authoritative: CacheEntry,
    /// A command was dispatched and its authoritative echo is outstanding
    pending: bool,
}

/// Shared, lock-protected map of entity id to reconciled entry
#[derive(Debug, Clone)]
pub struct StateCache {
    slots: Arc<RwLock<HashMap<EntityId, Slot>>>,
    events: EventBus,
}

impl StateCache {
    pub fn new(events: EventBus) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EntityId, Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EntityId, Slot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The entry consumers should render (may be optimistic)
    pub fn get(&self, entity_id: EntityId) -> Option<CacheEntry> {
        self.read().get(&entity_id).map(|slot| slot.current.clone())
    }

    /// The most recent entry that came from the server
    pub fn authoritative(&self, entity_id: EntityId) -> Option<CacheEntry> {
        self.read()
            .get(&entity_id)
            .map(|slot| slot.authoritative.clone())
    }

    pub fn version(&self, entity_id: EntityId) -> Option<Version> {
        self.read().get(&entity_id).map(|slot| slot.current.version)
    }

    pub fn is_pending(&self, entity_id: EntityId) -> bool {
        self.read()
            .get(&entity_id)
            .is_some_and(|slot| slot.pending)
    }

    pub fn clear_pending(&self, entity_id: EntityId) {
        if let Some(slot) = self.write().get_mut(&entity_id) {
            slot.pending = false;
        }
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Reconcile a state update received over the live connection
    pub fn apply_push(
        &self,
        entity_id: EntityId,
        version: Version,
        payload: serde_json::Value,
    ) -> ApplyOutcome {
        self.apply(CacheEntry::push(entity_id, version, payload))
    }

    /// Reconcile a full snapshot returned by a fetch
    pub fn apply_fetched(&self, entry: CacheEntry) -> ApplyOutcome {
        self.apply(entry)
    }

    fn apply(&self, entry: CacheEntry) -> ApplyOutcome {
        debug_assert!(entry.provenance.is_authoritative());

        let entity_id = entry.entity_id;
        let version = entry.version;
        let provenance = entry.provenance;

        let outcome = {
            let mut slots = self.write();
            match slots.get_mut(&entity_id) {
                None => {
                    slots.insert(
                        entity_id,
                        Slot {
                            current: entry.clone(),
                            authoritative: entry,
                            pending: false,
                        },
                    );
                    ApplyOutcome::Created
                }
                Some(slot) => {
                    // An optimistic entry sits at its base version, so this
                    // comparison also covers supersession.
                    let floor = slot.current.base_version();
                    if version > floor {
                        slot.current = entry.clone();
                        slot.authoritative = entry;
                        slot.pending = false;
                        ApplyOutcome::Replaced { previous: floor }
                    } else {
                        ApplyOutcome::Stale { current: floor }
                    }
                }
            }
        };

        match outcome {
            ApplyOutcome::Stale { current } => {
                tracing::debug!(
                    entity_id,
                    incoming = version,
                    current,
                    source = provenance.label(),
                    "discarding stale entry"
                );
            }
            _ => {
                tracing::debug!(
                    entity_id,
                    version,
                    source = provenance.label(),
                    "cache entry updated"
                );
                self.events.publish(SyncEvent::EntityUpdated {
                    entity_id,
                    version,
                    provenance,
                });
            }
        }

        outcome
    }

    /// A conditional fetch answered "not modified"
    ///
    /// Only `received_at` moves. Returns false when nothing is cached.
    pub fn mark_not_modified(&self, entity_id: EntityId) -> bool {
        let mut slots = self.write();
        let Some(slot) = slots.get_mut(&entity_id) else {
            return false;
        };

        let now = Utc::now();
        slot.authoritative.received_at = now;
        if slot.current.provenance.is_authoritative() {
            slot.current.received_at = now;
        }
        true
    }

    /// Replace the current entry with a speculative edit of it
    ///
    /// Sets the pending-action latch and returns the entry that was current
    /// before the write, to be handed back to [`rollback`](Self::rollback)
    /// if the command fails.
    pub fn begin_optimistic<F>(&self, entity_id: EntityId, edit: F) -> Result<CacheEntry, CommandError>
    where
        F: FnOnce(&serde_json::Value) -> serde_json::Value,
    {
        let (previous, speculative) = {
            let mut slots = self.write();
            let slot = slots
                .get_mut(&entity_id)
                .ok_or(CommandError::NotLoaded { entity_id })?;

            let previous = slot.current.clone();
            let speculative = previous.optimistic(edit(&previous.payload));
            slot.current = speculative.clone();
            slot.pending = true;
            (previous, speculative)
        };

        tracing::debug!(
            entity_id,
            base = speculative.base_version(),
            "optimistic entry written"
        );
        self.events.publish(SyncEvent::EntityUpdated {
            entity_id,
            version: speculative.version,
            provenance: speculative.provenance,
        });

        Ok(previous)
    }

    /// Undo an optimistic write after its command failed
    ///
    /// Restores `previous` verbatim when the optimistic entry derived from
    /// it is still current. If an authoritative entry has superseded it in
    /// the meantime, the cache is left alone. The latch is cleared either
    /// way. Returns whether the entry was restored.
    pub fn rollback(&self, previous: &CacheEntry) -> bool {
        let entity_id = previous.entity_id;

        let restored = {
            let mut slots = self.write();
            let Some(slot) = slots.get_mut(&entity_id) else {
                return false;
            };
            slot.pending = false;

            let still_speculative = slot.current.is_optimistic()
                && slot.current.base_version() == previous.base_version();
            if still_speculative {
                slot.current = previous.clone();
                if previous.provenance.is_authoritative() {
                    slot.authoritative = previous.clone();
                }
            }
            still_speculative
        };

        if restored {
            tracing::debug!(entity_id, version = previous.version, "optimistic entry rolled back");
            self.events.publish(SyncEvent::EntityRolledBack {
                entity_id,
                version: previous.version,
            });
        } else {
            tracing::debug!(entity_id, "rollback skipped, entry already superseded");
        }

        restored
    }

    /// Discard every speculative layer and fall back to the server's entry
    ///
    /// Applies only while the current entry is optimistic on top of `base`.
    /// Unlike [`rollback`](Self::rollback) this never restores an earlier
    /// guess. Clears the latch either way.
    pub fn revert_to_authoritative(&self, entity_id: EntityId, base: Version) -> bool {
        let reverted = {
            let mut slots = self.write();
            let Some(slot) = slots.get_mut(&entity_id) else {
                return false;
            };
            slot.pending = false;

            if slot.current.is_optimistic() && slot.current.base_version() == base {
                slot.current = slot.authoritative.clone();
                Some(slot.current.version)
            } else {
                None
            }
        };

        match reverted {
            Some(version) => {
                tracing::debug!(entity_id, version, "speculative entries discarded");
                self.events
                    .publish(SyncEvent::EntityRolledBack { entity_id, version });
                true
            }
            None => false,
        }
    }
}
