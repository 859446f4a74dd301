//! The user-visible "sync error" slot
//!
//! Two sources feed it: the last failed mutation and the global condition
//! (connection given up, fetch failure, expired session). The mutation
//! error wins while both are set.

use crate::core::events::{EventBus, SyncEvent};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Slots {
    mutation: Option<String>,
    global: Option<String>,
}

impl Slots {
    fn current(&self) -> Option<String> {
        self.mutation.clone().or_else(|| self.global.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    slots: Arc<Mutex<Slots>>,
    events: EventBus,
}

impl SyncStatus {
    pub fn new(events: EventBus) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            events,
        }
    }

    /// The most relevant unresolved error
    pub fn current(&self) -> Option<String> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current()
    }

    pub fn set_mutation_error(&self, error: Option<String>) {
        self.update(|slots| slots.mutation = error);
    }

    pub fn set_global_error(&self, error: Option<String>) {
        self.update(|slots| slots.global = error);
    }

    fn update(&self, change: impl FnOnce(&mut Slots)) {
        let (before, after) = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let before = slots.current();
            change(&mut slots);
            (before, slots.current())
        };

        if before != after {
            self.events
                .publish(SyncEvent::SyncErrorChanged { error: after });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_error_takes_precedence() {
        let status = SyncStatus::new(EventBus::new(16));
        status.set_global_error(Some("reconnect failed".into()));
        assert_eq!(status.current().as_deref(), Some("reconnect failed"));

        status.set_mutation_error(Some("bid rejected".into()));
        assert_eq!(status.current().as_deref(), Some("bid rejected"));

        status.set_mutation_error(None);
        assert_eq!(status.current().as_deref(), Some("reconnect failed"));

        status.set_global_error(None);
        assert_eq!(status.current(), None);
    }

    #[test]
    fn test_publishes_only_visible_changes() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let status = SyncStatus::new(events);

        status.set_mutation_error(Some("a".into()));
        // Hidden behind the mutation error
        status.set_global_error(Some("b".into()));
        status.set_mutation_error(None);

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|envelope| envelope.event)
            .collect();
        assert_eq!(
            seen,
            vec![
                SyncEvent::SyncErrorChanged {
                    error: Some("a".into())
                },
                SyncEvent::SyncErrorChanged {
                    error: Some("b".into())
                },
            ]
        );
    }
}
