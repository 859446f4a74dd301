//! Snapshot fetches feeding the cache
//!
//! A refresh is conditional (carries the stored validator) unless forced.
//! After a reconnection every subscribed entity is force-refetched, because
//! updates pushed while the connection was down are never replayed.

use super::{ApplyOutcome, StateCache};
use crate::core::entity::EntityId;
use crate::core::error::FetchError;
use crate::http::{FetchOutcome, SnapshotFetcher};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// What a refresh did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The server confirmed the cached entry is current
    NotModified,
    /// A full snapshot was reconciled
    Applied(ApplyOutcome),
}

/// Fetches snapshots and reconciles them into a [`StateCache`]
#[derive(Clone)]
pub struct Resynchronizer {
    cache: StateCache,
    fetcher: Arc<dyn SnapshotFetcher>,
    fetch_timeout: Duration,
}

impl Resynchronizer {
    pub fn new(cache: StateCache, fetcher: Arc<dyn SnapshotFetcher>, fetch_timeout: Duration) -> Self {
        Self {
            cache,
            fetcher,
            fetch_timeout,
        }
    }

    /// Fetch one entity
    ///
    /// With `force`, no validator is sent and a full snapshot is expected.
    /// On failure the cache keeps its last good entry.
    pub async fn refresh(&self, entity_id: EntityId, force: bool) -> Result<RefreshOutcome, FetchError> {
        let validator = if force {
            None
        } else {
            self.cache
                .authoritative(entity_id)
                .and_then(|entry| entry.validator)
        };

        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch(entity_id, validator.as_ref()),
        )
        .await
        .map_err(|_| FetchError::timeout(self.fetch_timeout))?;

        match fetched {
            Ok(FetchOutcome::NotModified) => {
                if !self.cache.mark_not_modified(entity_id) {
                    tracing::warn!(entity_id, "not-modified answer for an uncached entity");
                }
                Ok(RefreshOutcome::NotModified)
            }
            Ok(FetchOutcome::Modified(entry)) => {
                Ok(RefreshOutcome::Applied(self.cache.apply_fetched(entry)))
            }
            Err(e) => {
                tracing::warn!(entity_id, error = %e, forced = force, "snapshot fetch failed");
                Err(e)
            }
        }
    }

    /// Force-refetch every entity in `entity_ids`, concurrently
    ///
    /// Returns the failures; successful fetches were already applied.
    pub async fn resync_all(&self, entity_ids: &[EntityId]) -> Vec<(EntityId, FetchError)> {
        tracing::info!(entities = entity_ids.len(), "resynchronizing subscribed entities");

        let results = join_all(
            entity_ids
                .iter()
                .map(|&entity_id| async move { (entity_id, self.refresh(entity_id, true).await) }),
        )
        .await;

        results
            .into_iter()
            .filter_map(|(entity_id, result)| result.err().map(|e| (entity_id, e)))
            .collect()
    }
}
