//! Turn notification edge detector
//!
//! "It is the viewer's turn" is derived from authoritative snapshots only:
//! the viewer's seat equals the seat expected to act in a phase that
//! awaits a player. A [`SyncEvent::TurnStarted`] fires on the `false → true`
//! edge of that value, never while it merely stays true.
//!
//! Edge state is seeded from the last authoritative entry when a watch
//! starts, so the first observation is never mistaken for an edge.
//! Server `your_turn` hints are forwarded unless a command of ours is still
//! waiting for its echo or the edge already fired.

use crate::cache::StateCache;
use crate::core::entity::{EntityId, Version};
use crate::core::events::{EventBus, SyncEvent, TurnSource};
use crate::core::snapshot::{GameView, Seat};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default)]
struct TurnWatch {
    /// Learned from payloads rendered for the viewer, or set explicitly
    seat: Option<Seat>,
    /// `None` until the first observation
    is_turn: Option<bool>,
    version: Option<Version>,
}

/// Tracks the turn edge of every watched entity
#[derive(Debug, Clone)]
pub struct TurnDetector {
    cache: StateCache,
    events: EventBus,
    watches: Arc<Mutex<HashMap<EntityId, TurnWatch>>>,
}

impl TurnDetector {
    pub fn new(cache: StateCache, events: EventBus) -> Self {
        Self {
            cache,
            events,
            watches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityId, TurnWatch>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start (or restart) watching `entity_id`
    ///
    /// `seat` pins the viewer's seat; otherwise it is learned from the
    /// payloads. The edge is seeded from the cached authoritative entry.
    pub fn watch(&self, entity_id: EntityId, seat: Option<Seat>) {
        let mut watch = TurnWatch {
            seat,
            ..TurnWatch::default()
        };

        if let Some(entry) = self.cache.authoritative(entity_id) {
            let view = GameView::new(&entry.payload);
            watch.seat = watch.seat.or(view.viewer_seat());
            watch.is_turn = watch.seat.map(|s| view.is_turn_of(s));
            watch.version = Some(entry.version);
        }

        tracing::debug!(entity_id, seat = ?watch.seat, seeded = ?watch.is_turn, "watching turns");
        self.lock().insert(entity_id, watch);
    }

    pub fn unwatch(&self, entity_id: EntityId) {
        self.lock().remove(&entity_id);
    }

    pub fn is_watching(&self, entity_id: EntityId) -> bool {
        self.lock().contains_key(&entity_id)
    }

    /// Current edge value, `None` while it cannot be determined
    pub fn is_turn(&self, entity_id: EntityId) -> Option<bool> {
        self.lock().get(&entity_id).and_then(|w| w.is_turn)
    }

    /// Re-evaluate `entity_id` against its authoritative entry
    ///
    /// Returns true when a turn notification fired.
    pub fn observe(&self, entity_id: EntityId) -> bool {
        let Some(entry) = self.cache.authoritative(entity_id) else {
            return false;
        };
        let view = GameView::new(&entry.payload);

        let fired = {
            let mut watches = self.lock();
            let Some(watch) = watches.get_mut(&entity_id) else {
                return false;
            };
            if watch.version.is_some_and(|v| entry.version <= v) {
                return false;
            }
            watch.version = Some(entry.version);

            if watch.seat.is_none() {
                watch.seat = view.viewer_seat();
            }
            let Some(seat) = watch.seat else {
                return false;
            };

            let now = view.is_turn_of(seat);
            let before = watch.is_turn.replace(now);
            now && before == Some(false)
        };

        if fired {
            tracing::info!(entity_id, version = entry.version, "viewer's turn");
            self.events.publish(SyncEvent::TurnStarted {
                entity_id,
                source: TurnSource::Snapshot,
            });
        }
        fired
    }

    /// Handle a server `your_turn` hint
    ///
    /// Returns true when it was forwarded.
    pub fn on_hint(&self, entity_id: EntityId) -> bool {
        if self.cache.is_pending(entity_id) {
            tracing::debug!(entity_id, "turn hint suppressed, command echo outstanding");
            return false;
        }

        {
            let mut watches = self.lock();
            if let Some(watch) = watches.get_mut(&entity_id) {
                if watch.is_turn == Some(true) {
                    tracing::debug!(entity_id, "turn hint for an edge that already fired");
                    return false;
                }
                // The snapshot that follows must not fire the same turn again.
                watch.is_turn = Some(true);
            }
        }

        self.events.publish(SyncEvent::TurnStarted {
            entity_id,
            source: TurnSource::Hint,
        });
        true
    }

    /// Handle a server `invalidated` frame
    pub fn on_invalidated(&self, entity_id: Option<EntityId>) {
        tracing::debug!(?entity_id, "wait invalidated");
        self.events.publish(SyncEvent::WaitInvalidated { entity_id });
    }

    /// Re-evaluate watched entities whenever the cache reports an
    /// authoritative write
    pub fn spawn(&self) -> JoinHandle<()> {
        let detector = self.clone();
        let mut updates = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(envelope) => {
                        if let SyncEvent::EntityUpdated {
                            entity_id,
                            provenance,
                            ..
                        } = envelope.event
                        {
                            if provenance.is_authoritative() {
                                detector.observe(entity_id);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "turn detector lagged behind cache updates");
                        let ids: Vec<EntityId> = detector.lock().keys().copied().collect();
                        for entity_id in ids {
                            detector.observe(entity_id);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn snapshot(phase: &str, to_act: u8, viewer: Option<u8>) -> Value {
        json!({
            "game": {"phase": {"phase": phase, "data": {"to_act": to_act}}},
            "viewer": viewer.map(|seat| json!({"seat": seat, "hand": []}))
        })
    }

    fn setup() -> (StateCache, TurnDetector, broadcast::Receiver<crate::core::events::EventEnvelope>) {
        let events = EventBus::new(64);
        let cache = StateCache::new(events.clone());
        let detector = TurnDetector::new(cache.clone(), events.clone());
        let rx = events.subscribe();
        (cache, detector, rx)
    }

    fn turn_events(
        rx: &mut broadcast::Receiver<crate::core::events::EventEnvelope>,
    ) -> Vec<(EntityId, TurnSource)> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let SyncEvent::TurnStarted { entity_id, source } = envelope.event {
                out.push((entity_id, source));
            }
        }
        out
    }

    #[test]
    fn test_fires_only_on_rising_edge() {
        let (cache, detector, mut rx) = setup();
        cache.apply_push(1, 1, snapshot("Bidding", 0, Some(2)));
        detector.watch(1, None);
        assert_eq!(detector.is_turn(1), Some(false));

        cache.apply_push(1, 2, snapshot("Bidding", 2, Some(2)));
        assert!(detector.observe(1));

        // Still our turn, e.g. phase changed but same actor
        cache.apply_push(1, 3, snapshot("TrumpSelect", 2, Some(2)));
        assert!(!detector.observe(1));

        cache.apply_push(1, 4, snapshot("Trick", 3, Some(2)));
        assert!(!detector.observe(1));
        cache.apply_push(1, 5, snapshot("Trick", 2, Some(2)));
        assert!(detector.observe(1));

        assert_eq!(
            turn_events(&mut rx),
            vec![(1, TurnSource::Snapshot), (1, TurnSource::Snapshot)]
        );
    }

    #[test]
    fn test_seeded_true_does_not_fire() {
        let (cache, detector, mut rx) = setup();
        cache.apply_push(1, 1, snapshot("Bidding", 2, Some(2)));
        detector.watch(1, None);
        assert_eq!(detector.is_turn(1), Some(true));

        cache.apply_push(1, 2, snapshot("Bidding", 2, Some(2)));
        assert!(!detector.observe(1));
        assert!(turn_events(&mut rx).is_empty());
    }

    #[test]
    fn test_first_observation_seeds_without_firing() {
        let (cache, detector, _rx) = setup();
        detector.watch(1, None);
        assert_eq!(detector.is_turn(1), None);

        cache.apply_push(1, 1, snapshot("Bidding", 2, Some(2)));
        assert!(!detector.observe(1));
        assert_eq!(detector.is_turn(1), Some(true));
    }

    #[test]
    fn test_optimistic_entries_do_not_drive_edges() {
        let (cache, detector, _rx) = setup();
        cache.apply_push(1, 1, snapshot("Bidding", 0, Some(2)));
        detector.watch(1, None);

        cache
            .begin_optimistic(1, |_| snapshot("Bidding", 2, Some(2)))
            .unwrap();
        assert!(!detector.observe(1));
        assert_eq!(detector.is_turn(1), Some(false));
    }

    #[test]
    fn test_pinned_seat_for_spectator_payloads() {
        let (cache, detector, _rx) = setup();
        cache.apply_push(1, 1, snapshot("Trick", 0, None));
        detector.watch(1, Some(3));
        assert_eq!(detector.is_turn(1), Some(false));

        cache.apply_push(1, 2, snapshot("Trick", 3, None));
        assert!(detector.observe(1));
    }

    #[test]
    fn test_hint_forwarded_once() {
        let (cache, detector, mut rx) = setup();
        cache.apply_push(1, 1, snapshot("Bidding", 0, Some(2)));
        detector.watch(1, None);

        assert!(detector.on_hint(1));
        assert!(!detector.on_hint(1));

        // The snapshot confirming the hint does not notify again
        cache.apply_push(1, 2, snapshot("Bidding", 2, Some(2)));
        assert!(!detector.observe(1));
        assert_eq!(turn_events(&mut rx), vec![(1, TurnSource::Hint)]);
    }

    #[test]
    fn test_hint_suppressed_while_command_pending() {
        let (cache, detector, _rx) = setup();
        cache.apply_push(1, 1, snapshot("Bidding", 0, Some(2)));
        detector.watch(1, None);
        cache.begin_optimistic(1, |p| p.clone()).unwrap();

        assert!(!detector.on_hint(1));
    }

    #[test]
    fn test_invalidated_published() {
        let (_cache, detector, mut rx) = setup();
        detector.on_invalidated(Some(4));
        assert_eq!(
            rx.try_recv().unwrap().event,
            SyncEvent::WaitInvalidated { entity_id: Some(4) }
        );
    }

    #[tokio::test]
    async fn test_spawned_detector_follows_cache() {
        let (cache, detector, mut rx) = setup();
        cache.apply_push(1, 1, snapshot("Bidding", 0, Some(2)));
        detector.watch(1, None);
        let task = detector.spawn();

        cache.apply_push(1, 2, snapshot("Bidding", 2, Some(2)));

        let started = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let envelope = rx.recv().await.unwrap();
                if let SyncEvent::TurnStarted { entity_id, source } = envelope.event {
                    return (entity_id, source);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(started, (1, TurnSource::Snapshot));
        task.abort();
    }
}
