//! Bounded exponential reconnect backoff

use crate::config::SyncConfig;
use std::time::Duration;

/// Reconnection bookkeeping: `{attempt_count, current_delay, max_attempts}`
///
/// Each scheduled retry consumes one attempt and doubles the delay up to
/// the ceiling. A successful handshake calls [`reset`](Self::reset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectState {
    attempt_count: u32,
    current_delay: Duration,
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ReconnectState {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            current_delay: initial_delay.min(max_delay),
            initial_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.backoff_initial(),
            config.backoff_max(),
            config.max_attempts,
        )
    }

    /// Claim the next retry
    ///
    /// Returns the delay to wait before it, or `None` once `max_attempts`
    /// retries have been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.current_delay;
        self.current_delay = delay.saturating_mul(2).min(self.max_delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.current_delay = self.initial_delay.min(self.max_delay);
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Delay the next retry will wait
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_delay_doubles_until_ceiling() {
        let mut state = ReconnectState::new(ms(100), ms(1000), 10);
        let delays: Vec<_> = std::iter::from_fn(|| state.next_delay()).take(7).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000), ms(1000)]
        );
    }

    #[test]
    fn test_delays_bounded_and_non_decreasing() {
        for (initial, max) in [(1, 1), (3, 100), (250, 30_000), (7, 8)] {
            let mut state = ReconnectState::new(ms(initial), ms(max), 50);
            let mut last = Duration::ZERO;
            while let Some(delay) = state.next_delay() {
                assert!(delay <= ms(max));
                assert!(delay >= last);
                last = delay;
            }
            assert_eq!(state.attempt_count(), 50);
        }
    }

    #[test]
    fn test_exhaustion() {
        let mut state = ReconnectState::new(ms(10), ms(100), 3);
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.is_exhausted());
        assert_eq!(state.next_delay(), None);
        assert_eq!(state.attempt_count(), 3);
    }

    #[test]
    fn test_reset_restores_initial_values() {
        let mut state = ReconnectState::new(ms(10), ms(100), 3);
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.current_delay(), ms(10));
    }
}
