//! Host lifecycle signals (visibility, freeze/resume, network, focus)
//!
//! The embedding application reports what the host environment is doing by
//! calling [`HostLifecycle::emit`]. Connection managers subscribe to the
//! resulting [`HostEvent`] stream to defer reconnects while the host is
//! suspended and to reconnect immediately once it becomes active again.
//!
//! A single process-wide registry is available through
//! [`HostLifecycle::global`]; it is created on first use and shared by every
//! manager, so host listeners are installed exactly once.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::broadcast;

/// A raw signal from the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum HostSignal {
    VisibilityChanged { visible: bool },
    Frozen,
    Resumed,
    Online,
    Offline,
    FocusGained,
}

/// A signal together with the host activity it resulted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent {
    pub signal: HostSignal,
    /// Visible, not frozen and online
    pub active: bool,
}

#[derive(Debug, Clone, Copy)]
struct HostState {
    visible: bool,
    frozen: bool,
    online: bool,
}

impl HostState {
    fn is_active(&self) -> bool {
        self.visible && !self.frozen && self.online
    }

    fn apply(&mut self, signal: HostSignal) {
        match signal {
            HostSignal::VisibilityChanged { visible } => self.visible = visible,
            HostSignal::Frozen => self.frozen = true,
            HostSignal::Resumed => self.frozen = false,
            HostSignal::Online => self.online = true,
            HostSignal::Offline => self.online = false,
            // Focus implies the user is looking at us
            HostSignal::FocusGained => self.visible = true,
        }
    }
}

/// Registry of host lifecycle listeners
///
/// Clones share the same state and subscribers.
#[derive(Debug, Clone)]
pub struct HostLifecycle {
    sender: broadcast::Sender<HostEvent>,
    state: Arc<Mutex<HostState>>,
}

impl HostLifecycle {
    /// Create an isolated registry (the host starts active)
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            state: Arc::new(Mutex::new(HostState {
                visible: true,
                frozen: false,
                online: true,
            })),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static HostLifecycle {
        static GLOBAL: OnceLock<HostLifecycle> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            tracing::debug!("host lifecycle registry initialized");
            HostLifecycle::new()
        })
    }

    /// Record a host signal and notify every subscriber
    pub fn emit(&self, signal: HostSignal) -> HostEvent {
        let active = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.apply(signal);
            state.is_active()
        };

        tracing::debug!(?signal, active, "host lifecycle signal");
        let event = HostEvent { signal, active };
        let _ = self.sender.send(event);
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_active()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for HostLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_starts_active() {
        assert!(HostLifecycle::new().is_active());
    }

    #[test]
    fn test_activity_combines_signals() {
        let lifecycle = HostLifecycle::new();

        assert!(!lifecycle.emit(HostSignal::VisibilityChanged { visible: false }).active);
        assert!(!lifecycle.emit(HostSignal::Offline).active);
        // Visible again, still offline
        assert!(!lifecycle.emit(HostSignal::FocusGained).active);
        assert!(lifecycle.emit(HostSignal::Online).active);

        assert!(!lifecycle.emit(HostSignal::Frozen).active);
        assert!(lifecycle.emit(HostSignal::Resumed).active);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let lifecycle = HostLifecycle::new();
        let mut rx = lifecycle.subscribe();
        assert_eq!(lifecycle.subscriber_count(), 1);

        lifecycle.emit(HostSignal::Frozen);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.signal, HostSignal::Frozen);
        assert!(!event.active);

        drop(rx);
        assert_eq!(lifecycle.subscriber_count(), 0);
    }

    #[test]
    fn test_global_is_a_singleton() {
        let a = HostLifecycle::global() as *const HostLifecycle;
        let b = HostLifecycle::global() as *const HostLifecycle;
        assert_eq!(a, b);
    }
}
