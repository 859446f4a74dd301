//! Sans-IO connection state machine
//!
//! ```text
//!                 Connect
//!  Disconnected ──────────▶ Connecting ──hello_ack──▶ Connected
//!       ▲                      │                         │
//!       │ exhausted /          │ close / timeout /       │ drop / stall
//!       │ Disconnect           ▼ open failure            ▼
//!       └────────────────── Reconnecting ◀───────────────┘
//!                              │   ▲
//!                              └───┘ retry after backoff
//! ```
//!
//! Every attempt gets a fresh [`Epoch`]. Inputs carrying any other epoch, or
//! arriving when their attempt is already over, are dropped without
//! touching the state. A manual disconnect also retires the current epoch.

use super::ConnectionStatus;
use super::backoff::ReconnectState;
use crate::config::SyncConfig;
use crate::core::error::{ConnectionError, SyncError, TransportError};
use crate::protocol::{ClientFrame, ServerFrame};
use std::time::Duration;

/// Identifier of one connection attempt
pub type Epoch = u64;

/// Everything that can happen to the connection
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The user wants to be connected
    Connect,
    /// The user no longer wants to be connected
    Disconnect,
    /// The transport of attempt `epoch` is open
    Opened { epoch: Epoch },
    /// The transport of attempt `epoch` could not be opened
    OpenFailed { epoch: Epoch, error: SyncError },
    /// A decoded frame arrived on attempt `epoch`
    Frame { epoch: Epoch, frame: ServerFrame },
    /// Non-fatal transport error (the close event is authoritative)
    TransportError { epoch: Epoch, error: TransportError },
    /// The transport of attempt `epoch` closed
    Closed { epoch: Epoch },
    /// Nothing was received on attempt `epoch` for the liveness window
    Stalled { epoch: Epoch },
    HandshakeTimedOut { epoch: Epoch },
    RetryTimerFired { epoch: Epoch },
    /// Host activity changed, or the host reported it again
    Host { active: bool },
}

/// Work the manager must carry out
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Open { epoch: Epoch },
    Send { epoch: Epoch, frame: ClientFrame },
    Close { epoch: Epoch },
    StartHandshakeTimer { epoch: Epoch, timeout: Duration },
    CancelHandshakeTimer,
    ScheduleRetry { epoch: Epoch, delay: Duration },
    CancelRetry,
    /// Handshake done: resubscribe and resynchronize
    Established { epoch: Epoch, user_id: Option<i64> },
    /// A frame for the rest of the engine
    Deliver { frame: ServerFrame },
    /// Attempt `epoch` is over; anything waiting on it must fail
    AttemptEnded { epoch: Epoch },
    StatusChanged { status: ConnectionStatus, attempt: u32 },
    /// Terminal failure surfaced to the user
    Failed { error: SyncError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Handshaking,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Idle,
    /// A retry timer is running
    Scheduled,
    /// The timer fired while the host was inactive
    Deferred,
}

/// The connection lifecycle, free of any I/O
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    epoch: Epoch,
    status: ConnectionStatus,
    reported_attempt: u32,
    /// Connect was requested and not withdrawn
    desired: bool,
    host_active: bool,
    phase: Option<Phase>,
    retry: Retry,
    backoff: ReconnectState,
    protocol_version: u32,
    handshake_timeout: Duration,
}

impl ConnectionMachine {
    pub fn new(backoff: ReconnectState, protocol_version: u32, handshake_timeout: Duration) -> Self {
        Self {
            epoch: 0,
            status: ConnectionStatus::Disconnected,
            reported_attempt: 0,
            desired: false,
            host_active: true,
            phase: None,
            retry: Retry::Idle,
            backoff,
            protocol_version,
            handshake_timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            ReconnectState::from_config(config),
            config.protocol_version,
            config.handshake_timeout(),
        )
    }

    pub fn with_host_active(mut self, active: bool) -> Self {
        self.host_active = active;
        self
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.backoff.attempt_count()
    }

    /// Handshake completed on the current epoch
    pub fn is_established(&self) -> bool {
        self.phase == Some(Phase::Established)
    }

    /// A retry is waiting for the host to become active
    pub fn is_retry_deferred(&self) -> bool {
        self.retry == Retry::Deferred
    }

    /// Feed one input, get the effects to execute in order
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();

        match input {
            Input::Connect => self.on_connect(&mut effects),
            Input::Disconnect => self.on_disconnect(&mut effects),
            Input::Host { active } => self.on_host(active, &mut effects),

            Input::Opened { epoch } => {
                if self.is_current(epoch, &[Phase::Opening]) {
                    self.phase = Some(Phase::Handshaking);
                    effects.push(Effect::Send {
                        epoch,
                        frame: ClientFrame::Hello {
                            protocol: self.protocol_version,
                        },
                    });
                    effects.push(Effect::StartHandshakeTimer {
                        epoch,
                        timeout: self.handshake_timeout,
                    });
                }
            }

            Input::OpenFailed { epoch, error } => {
                if self.is_current(epoch, &[Phase::Opening]) {
                    tracing::warn!(epoch, error = %error, "connection attempt failed");
                    self.end_attempt(epoch, &mut effects);
                    if error.is_terminal() {
                        self.terminate(error, &mut effects);
                    } else {
                        self.schedule_retry(&mut effects);
                    }
                }
            }

            Input::Frame { epoch, frame } => {
                if self.is_current(epoch, &[Phase::Handshaking, Phase::Established]) {
                    self.on_frame(epoch, frame, &mut effects);
                }
            }

            Input::TransportError { epoch, error } => {
                if epoch == self.epoch {
                    tracing::warn!(epoch, error = %error, "transport error");
                }
            }

            Input::Closed { epoch } => {
                let live = [Phase::Opening, Phase::Handshaking, Phase::Established];
                if self.is_current(epoch, &live) {
                    if self.is_established() {
                        tracing::info!(epoch, "connection dropped");
                    } else {
                        tracing::warn!(epoch, "connection closed during handshake");
                    }
                    self.end_attempt(epoch, &mut effects);
                    self.schedule_retry(&mut effects);
                }
            }

            Input::Stalled { epoch } => {
                if self.is_current(epoch, &[Phase::Handshaking, Phase::Established]) {
                    tracing::warn!(epoch, "connection stalled");
                    effects.push(Effect::Close { epoch });
                    self.end_attempt(epoch, &mut effects);
                    self.schedule_retry(&mut effects);
                }
            }

            Input::HandshakeTimedOut { epoch } => {
                if self.is_current(epoch, &[Phase::Handshaking]) {
                    tracing::warn!(epoch, "handshake timed out");
                    effects.push(Effect::Close { epoch });
                    self.end_attempt(epoch, &mut effects);
                    self.schedule_retry(&mut effects);
                }
            }

            Input::RetryTimerFired { epoch } => {
                if epoch == self.epoch && self.retry == Retry::Scheduled {
                    if self.host_active {
                        self.start_attempt(ConnectionStatus::Reconnecting, &mut effects);
                    } else {
                        tracing::debug!(epoch, "host inactive, deferring reconnect");
                        self.retry = Retry::Deferred;
                    }
                }
            }
        }

        effects
    }

    fn is_current(&self, epoch: Epoch, phases: &[Phase]) -> bool {
        if epoch != self.epoch {
            tracing::trace!(epoch, current = self.epoch, "ignoring stale input");
            return false;
        }
        self.phase.is_some_and(|phase| phases.contains(&phase))
    }

    fn on_connect(&mut self, effects: &mut Vec<Effect>) {
        if self.desired && (self.phase.is_some() || self.retry != Retry::Idle) {
            return;
        }

        self.desired = true;
        self.backoff.reset();

        if self.host_active {
            self.start_attempt(ConnectionStatus::Connecting, effects);
        } else {
            tracing::debug!("host inactive, deferring connect");
            self.retry = Retry::Deferred;
            self.set_status(ConnectionStatus::Connecting, effects);
        }
    }

    fn on_disconnect(&mut self, effects: &mut Vec<Effect>) {
        self.desired = false;
        effects.push(Effect::CancelRetry);
        self.retry = Retry::Idle;

        if self.phase.is_some() {
            let epoch = self.epoch;
            effects.push(Effect::Close { epoch });
            self.end_attempt(epoch, effects);
        }

        // Retire the epoch so late events of the closed attempt are ignored.
        self.epoch += 1;
        self.backoff.reset();
        self.set_status(ConnectionStatus::Disconnected, effects);
    }

    fn on_host(&mut self, active: bool, effects: &mut Vec<Effect>) {
        self.host_active = active;
        if !active || !self.desired || self.phase.is_some() {
            return;
        }

        // Waiting on a retry (or a deferred one): go now.
        tracing::info!("host became active, reconnecting immediately");
        effects.push(Effect::CancelRetry);
        self.backoff.reset();
        let status = match self.status {
            ConnectionStatus::Connecting => ConnectionStatus::Connecting,
            _ => ConnectionStatus::Reconnecting,
        };
        self.start_attempt(status, effects);
    }

    fn on_frame(&mut self, epoch: Epoch, frame: ServerFrame, effects: &mut Vec<Effect>) {
        match frame {
            ServerFrame::HelloAck { protocol, user_id } if self.phase == Some(Phase::Handshaking) => {
                if protocol.is_some_and(|p| p != self.protocol_version) {
                    tracing::warn!(epoch, ?protocol, "server acknowledged another protocol version");
                }
                tracing::info!(epoch, ?user_id, "connection established");
                self.phase = Some(Phase::Established);
                self.backoff.reset();
                effects.push(Effect::CancelHandshakeTimer);
                self.set_status(ConnectionStatus::Connected, effects);
                effects.push(Effect::Established { epoch, user_id });
            }
            ServerFrame::HelloAck { .. } => {
                tracing::debug!(epoch, "ignoring repeated hello_ack");
            }
            frame => effects.push(Effect::Deliver { frame }),
        }
    }

    fn start_attempt(&mut self, status: ConnectionStatus, effects: &mut Vec<Effect>) {
        self.epoch += 1;
        self.phase = Some(Phase::Opening);
        self.retry = Retry::Idle;
        tracing::debug!(epoch = self.epoch, attempt = self.backoff.attempt_count(), "opening connection");
        effects.push(Effect::Open { epoch: self.epoch });
        self.set_status(status, effects);
    }

    fn end_attempt(&mut self, epoch: Epoch, effects: &mut Vec<Effect>) {
        if self.phase == Some(Phase::Handshaking) {
            effects.push(Effect::CancelHandshakeTimer);
        }
        self.phase = None;
        effects.push(Effect::AttemptEnded { epoch });
    }

    fn schedule_retry(&mut self, effects: &mut Vec<Effect>) {
        if !self.desired {
            self.set_status(ConnectionStatus::Disconnected, effects);
            return;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = self.backoff.attempt_count(),
                    ?delay,
                    "scheduling reconnect"
                );
                self.retry = Retry::Scheduled;
                effects.push(Effect::ScheduleRetry {
                    epoch: self.epoch,
                    delay,
                });
                self.set_status(ConnectionStatus::Reconnecting, effects);
            }
            None => {
                let attempts = self.backoff.attempt_count();
                self.terminate(ConnectionError::AttemptsExhausted { attempts }.into(), effects);
            }
        }
    }

    fn terminate(&mut self, error: SyncError, effects: &mut Vec<Effect>) {
        tracing::error!(error = %error, "giving up on connection");
        self.desired = false;
        self.retry = Retry::Idle;
        effects.push(Effect::CancelRetry);
        self.set_status(ConnectionStatus::Disconnected, effects);
        effects.push(Effect::Failed { error });
    }

    fn set_status(&mut self, status: ConnectionStatus, effects: &mut Vec<Effect>) {
        let attempt = self.backoff.attempt_count();
        if self.status != status || self.reported_attempt != attempt {
            self.status = status;
            self.reported_attempt = attempt;
            effects.push(Effect::StatusChanged { status, attempt });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SessionError;

    const D: Duration = Duration::from_millis(100);

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(
            ReconnectState::new(D, Duration::from_secs(5), 5),
            1,
            Duration::from_secs(10),
        )
    }

    fn hello_ack() -> ServerFrame {
        ServerFrame::HelloAck {
            protocol: Some(1),
            user_id: Some(7),
        }
    }

    /// Drive a fresh machine to `Connected`, returning the live epoch
    fn connected(m: &mut ConnectionMachine) -> Epoch {
        m.handle(Input::Connect);
        let epoch = m.epoch();
        m.handle(Input::Opened { epoch });
        m.handle(Input::Frame {
            epoch,
            frame: hello_ack(),
        });
        assert!(m.is_established());
        epoch
    }

    fn scheduled_delay(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleRetry { delay, .. } => Some(*delay),
            _ => None,
        })
    }

    // === Handshake ===

    #[test]
    fn test_connect_opens_then_sends_hello() {
        let mut m = machine();
        let effects = m.handle(Input::Connect);
        assert_eq!(
            effects,
            vec![
                Effect::Open { epoch: 1 },
                Effect::StatusChanged {
                    status: ConnectionStatus::Connecting,
                    attempt: 0
                }
            ]
        );

        let effects = m.handle(Input::Opened { epoch: 1 });
        assert_eq!(
            effects,
            vec![
                Effect::Send {
                    epoch: 1,
                    frame: ClientFrame::Hello { protocol: 1 }
                },
                Effect::StartHandshakeTimer {
                    epoch: 1,
                    timeout: Duration::from_secs(10)
                },
            ]
        );
    }

    #[test]
    fn test_hello_ack_establishes() {
        let mut m = machine();
        m.handle(Input::Connect);
        m.handle(Input::Opened { epoch: 1 });

        let effects = m.handle(Input::Frame {
            epoch: 1,
            frame: hello_ack(),
        });
        assert_eq!(
            effects,
            vec![
                Effect::CancelHandshakeTimer,
                Effect::StatusChanged {
                    status: ConnectionStatus::Connected,
                    attempt: 0
                },
                Effect::Established {
                    epoch: 1,
                    user_id: Some(7)
                },
            ]
        );
        assert_eq!(m.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_handshake_timeout_is_a_failed_attempt() {
        let mut m = machine();
        m.handle(Input::Connect);
        m.handle(Input::Opened { epoch: 1 });

        let effects = m.handle(Input::HandshakeTimedOut { epoch: 1 });
        assert!(effects.contains(&Effect::Close { epoch: 1 }));
        assert!(effects.contains(&Effect::AttemptEnded { epoch: 1 }));
        assert_eq!(scheduled_delay(&effects), Some(D));
        assert_eq!(m.status(), ConnectionStatus::Reconnecting);
        assert_eq!(m.attempt_count(), 1);
    }

    #[test]
    fn test_connect_is_idempotent_while_connecting() {
        let mut m = machine();
        m.handle(Input::Connect);
        assert!(m.handle(Input::Connect).is_empty());
        assert_eq!(m.epoch(), 1);
    }

    // === Frames ===

    #[test]
    fn test_frames_delivered_after_handshake() {
        let mut m = machine();
        let epoch = connected(&mut m);
        let frame = ServerFrame::Invalidated { entity_id: None };

        let effects = m.handle(Input::Frame {
            epoch,
            frame: frame.clone(),
        });
        assert_eq!(effects, vec![Effect::Deliver { frame }]);

        // A second hello_ack is not a second handshake
        assert!(m.handle(Input::Frame { epoch, frame: hello_ack() }).is_empty());
    }

    #[test]
    fn test_transport_error_does_not_close() {
        let mut m = machine();
        let epoch = connected(&mut m);
        let effects = m.handle(Input::TransportError {
            epoch,
            error: TransportError::Receive("reset".into()),
        });
        assert!(effects.is_empty());
        assert!(m.is_established());
    }

    // === Reconnection ===

    #[test]
    fn test_drop_then_backoff_then_recovery() {
        let mut m = machine();
        let epoch = connected(&mut m);

        let mut effects = m.handle(Input::Closed { epoch });
        let mut delays = Vec::new();

        // Three attempts fail: d, 2d, 4d
        for _ in 0..3 {
            delays.push(scheduled_delay(&effects).unwrap());
            m.handle(Input::RetryTimerFired { epoch: m.epoch() });
            let attempt_epoch = m.epoch();
            m.handle(Input::Opened { epoch: attempt_epoch });
            effects = m.handle(Input::Closed { epoch: attempt_epoch });
        }
        assert_eq!(delays, vec![D, D * 2, D * 4]);
        assert_eq!(m.attempt_count(), 4);

        // Fourth succeeds
        m.handle(Input::RetryTimerFired { epoch: m.epoch() });
        let epoch = m.epoch();
        m.handle(Input::Opened { epoch });
        let effects = m.handle(Input::Frame {
            epoch,
            frame: hello_ack(),
        });

        assert_eq!(m.attempt_count(), 0);
        assert!(effects.iter().any(|e| matches!(e, Effect::Established { .. })));
        assert!(effects.contains(&Effect::StatusChanged {
            status: ConnectionStatus::Connected,
            attempt: 0
        }));
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        let mut m = ConnectionMachine::new(ReconnectState::new(D, D * 4, 2), 1, D);
        m.handle(Input::Connect);

        for _ in 0..2 {
            let epoch = m.epoch();
            m.handle(Input::OpenFailed {
                epoch,
                error: TransportError::Connect("refused".into()).into(),
            });
            m.handle(Input::RetryTimerFired { epoch: m.epoch() });
        }

        let epoch = m.epoch();
        let effects = m.handle(Input::OpenFailed {
            epoch,
            error: TransportError::Connect("refused".into()).into(),
        });
        assert!(effects.contains(&Effect::Failed {
            error: ConnectionError::AttemptsExhausted { attempts: 2 }.into()
        }));
        assert_eq!(m.status(), ConnectionStatus::Disconnected);

        // Host activity does not revive it
        assert!(m.handle(Input::Host { active: true }).is_empty());
        // An explicit connect does
        assert!(m.handle(Input::Connect).contains(&Effect::Open { epoch: m.epoch() }));
    }

    #[test]
    fn test_session_failure_is_terminal_without_retry() {
        let mut m = machine();
        m.handle(Input::Connect);
        let effects = m.handle(Input::OpenFailed {
            epoch: 1,
            error: SessionError::Expired.into(),
        });
        assert_eq!(scheduled_delay(&effects), None);
        assert!(effects.contains(&Effect::Failed {
            error: SessionError::Expired.into()
        }));
    }

    #[test]
    fn test_manual_disconnect_never_retries() {
        let mut m = machine();
        let epoch = connected(&mut m);

        let effects = m.handle(Input::Disconnect);
        assert!(effects.contains(&Effect::Close { epoch }));
        assert!(effects.contains(&Effect::CancelRetry));
        assert_eq!(m.status(), ConnectionStatus::Disconnected);

        // The close event of the retired transport arrives late
        assert!(m.handle(Input::Closed { epoch }).is_empty());
        assert!(m.handle(Input::RetryTimerFired { epoch }).is_empty());
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
    }

    // === Epoch isolation ===

    #[test]
    fn test_stale_epoch_inputs_are_inert() {
        let mut m = machine();
        let old = connected(&mut m);
        m.handle(Input::Closed { epoch: old });
        m.handle(Input::RetryTimerFired { epoch: m.epoch() });
        let current = m.epoch();
        m.handle(Input::Opened { epoch: current });
        m.handle(Input::Frame {
            epoch: current,
            frame: hello_ack(),
        });

        let status = m.status();
        let attempts = m.attempt_count();
        let stale_inputs = vec![
            Input::Opened { epoch: old },
            Input::Frame {
                epoch: old,
                frame: hello_ack(),
            },
            Input::Frame {
                epoch: old,
                frame: ServerFrame::Invalidated { entity_id: Some(1) },
            },
            Input::Closed { epoch: old },
            Input::Stalled { epoch: old },
            Input::HandshakeTimedOut { epoch: old },
            Input::RetryTimerFired { epoch: old },
            Input::OpenFailed {
                epoch: old,
                error: SessionError::Expired.into(),
            },
            Input::Closed { epoch: current + 1 },
        ];

        for input in stale_inputs {
            assert!(m.handle(input).is_empty());
        }
        assert_eq!(m.status(), status);
        assert_eq!(m.attempt_count(), attempts);
        assert_eq!(m.epoch(), current);
        assert!(m.is_established());
    }

    // === Host lifecycle ===

    #[test]
    fn test_retry_deferred_while_host_inactive() {
        let mut m = machine();
        let epoch = connected(&mut m);
        m.handle(Input::Host { active: false });
        m.handle(Input::Closed { epoch });

        assert!(m.handle(Input::RetryTimerFired { epoch }).is_empty());
        assert!(m.is_retry_deferred());

        let effects = m.handle(Input::Host { active: true });
        assert_eq!(effects[0], Effect::CancelRetry);
        assert!(effects.contains(&Effect::Open { epoch: epoch + 1 }));
        assert_eq!(m.attempt_count(), 0);
    }

    #[test]
    fn test_host_active_skips_remaining_backoff() {
        let mut m = machine();
        let epoch = connected(&mut m);
        m.handle(Input::Closed { epoch });
        assert_eq!(m.attempt_count(), 1);

        let effects = m.handle(Input::Host { active: true });
        assert!(effects.contains(&Effect::Open { epoch: epoch + 1 }));
        assert_eq!(m.attempt_count(), 0);

        // The old retry timer is now stale
        assert!(m.handle(Input::RetryTimerFired { epoch }).is_empty());
    }

    #[test]
    fn test_host_active_while_connected_is_noop() {
        let mut m = machine();
        connected(&mut m);
        assert!(m.handle(Input::Host { active: true }).is_empty());
    }

    #[test]
    fn test_connect_while_host_inactive_waits() {
        let mut m = machine().with_host_active(false);
        let effects = m.handle(Input::Connect);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Open { .. })));
        assert_eq!(m.status(), ConnectionStatus::Connecting);

        let effects = m.handle(Input::Host { active: true });
        assert!(effects.contains(&Effect::Open { epoch: 1 }));
    }
}
