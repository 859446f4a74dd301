//! Reference-counted topic interest
//!
//! Consumers declare interest in an entity by holding a [`Subscription`].
//! The first holder of a topic causes a `subscribe` frame, the last one to
//! drop it causes an `unsubscribe`. Subscriptions do not survive a
//! reconnection server-side, so the connection manager replays
//! [`SubscriptionTracker::resubscribe_frames`] after every handshake.

use crate::core::entity::Topic;
use crate::protocol::ClientFrame;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Somewhere outbound frames can be queued
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: ClientFrame);
}

/// Interest counts per topic, in first-subscribed order
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    interests: Arc<Mutex<IndexMap<Topic, usize>>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<Topic, usize>> {
        self.interests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register one more consumer of `topic`
    ///
    /// Returns the frame to send when this is the first interest.
    pub fn acquire(&self, topic: Topic) -> Option<ClientFrame> {
        let mut interests = self.lock();
        let count = interests.entry(topic).or_insert(0);
        *count += 1;

        (*count == 1).then_some(ClientFrame::Subscribe { topic })
    }

    /// Withdraw one consumer of `topic`
    ///
    /// Returns the frame to send when this was the last interest.
    pub fn release(&self, topic: Topic) -> Option<ClientFrame> {
        let mut interests = self.lock();
        let count = interests.get_mut(&topic)?;
        *count -= 1;

        if *count == 0 {
            interests.shift_remove(&topic);
            Some(ClientFrame::Unsubscribe { topic })
        } else {
            None
        }
    }

    pub fn interest(&self, topic: Topic) -> usize {
        self.lock().get(&topic).copied().unwrap_or(0)
    }

    /// Topics with at least one consumer
    pub fn topics(&self) -> Vec<Topic> {
        self.lock().keys().copied().collect()
    }

    /// One `subscribe` per interested topic
    pub fn resubscribe_frames(&self) -> Vec<ClientFrame> {
        self.topics()
            .into_iter()
            .map(|topic| ClientFrame::Subscribe { topic })
            .collect()
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Interest in a topic, withdrawn on drop
pub struct Subscription {
    topic: Topic,
    tracker: SubscriptionTracker,
    sink: Arc<dyn FrameSink>,
    on_last_release: Option<ReleaseHook>,
}

impl Subscription {
    /// Acquire interest and send `subscribe` if it is the first
    pub fn open(topic: Topic, tracker: SubscriptionTracker, sink: Arc<dyn FrameSink>) -> Self {
        if let Some(frame) = tracker.acquire(topic) {
            tracing::debug!(%topic, "subscribing");
            sink.send_frame(frame);
        }
        Self {
            topic,
            tracker,
            sink,
            on_last_release: None,
        }
    }

    /// Run `hook` if this handle turns out to hold the topic's last interest
    pub fn on_last_release<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_last_release = Some(Box::new(hook));
        self
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(frame) = self.tracker.release(self.topic) {
            tracing::debug!(topic = %self.topic, "unsubscribing");
            self.sink.send_frame(frame);
            if let Some(hook) = self.on_last_release.take() {
                hook();
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}
