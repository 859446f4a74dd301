//! Connection manager actor
//!
//! The manager owns at most one live transport. Everything that can affect
//! the connection reaches it as a message: user commands through the
//! [`ConnectionHandle`], transport and timer events through an internal
//! channel (each tagged with the epoch of its attempt), and host lifecycle
//! signals through the [`HostLifecycle`] broadcast. Messages are fed to the
//! [`ConnectionMachine`] one at a time and the resulting effects executed.
//!
//! ```text
//! ConnectionHandle ──cmd──┐
//! attempt task ──input────┼──▶ actor ──▶ ConnectionMachine::handle() ──▶ effects
//! timers ──input──────────┤                                     │
//! HostLifecycle ──signal──┘                     ManagerEvent ◀──┘
//! ```

use super::machine::{ConnectionMachine, Effect, Epoch, Input};
use super::{ConnectionState, ConnectionStatus};
use crate::config::SyncConfig;
use crate::core::entity::{EntityId, Version};
use crate::core::error::{CommandError, ConnectionError, SyncError};
use crate::core::events::{EventBus, SyncEvent};
use crate::core::lifecycle::{HostEvent, HostLifecycle};
use crate::http::CommandReceipt;
use crate::protocol::{self, ClientFrame, GameAction, ServerFrame};
use crate::subscription::{FrameSink, SubscriptionTracker};
use crate::transport::{Connector, TransportMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What the manager reports to the rest of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// Handshake completed; subscriptions were replayed
    Established { epoch: Epoch, user_id: Option<i64> },
    /// A frame for the cache or the turn detector
    Frame(ServerFrame),
    /// The manager gave up (attempts exhausted or session expired)
    Failed(SyncError),
}

type CommandReply = oneshot::Sender<Result<CommandReceipt, CommandError>>;

enum ManagerCommand {
    Connect,
    Disconnect,
    Send(ClientFrame),
    Command {
        request_id: Uuid,
        frame: ClientFrame,
        reply: CommandReply,
    },
    Shutdown,
}

/// Cloneable control surface of a running manager
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<ManagerCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Ask for a connection (no-op when already connecting or connected)
    pub fn connect(&self) {
        let _ = self.commands.send(ManagerCommand::Connect);
    }

    /// Close the connection without scheduling a reconnect
    pub fn disconnect(&self) {
        let _ = self.commands.send(ManagerCommand::Disconnect);
    }

    /// Disconnect and stop the actor
    pub fn shutdown(&self) {
        let _ = self.commands.send(ManagerCommand::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Receiver notified on every status or attempt change
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the status satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> Result<ConnectionState, ConnectionError>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut state = self.state.clone();
        state
            .wait_for(predicate)
            .await
            .map(|state| *state)
            .map_err(|_| ConnectionError::Shutdown)
    }

    /// Send a command on the live connection and wait for its acknowledgement
    ///
    /// Fails immediately when not connected. The caller bounds the wait.
    pub async fn send_command(
        &self,
        entity_id: EntityId,
        version: Version,
        action: GameAction,
    ) -> Result<CommandReceipt, CommandError> {
        let request_id = Uuid::new_v4();
        let (reply, response) = oneshot::channel();
        let frame = ClientFrame::Command {
            request_id,
            entity_id,
            version,
            action,
        };

        self.commands
            .send(ManagerCommand::Command {
                request_id,
                frame,
                reply,
            })
            .map_err(|_| CommandError::Delivery(ConnectionError::Shutdown.to_string()))?;

        response
            .await
            .map_err(|_| CommandError::Delivery(ConnectionError::Shutdown.to_string()))?
    }
}

impl FrameSink for ConnectionHandle {
    fn send_frame(&self, frame: ClientFrame) {
        let _ = self.commands.send(ManagerCommand::Send(frame));
    }
}

struct LiveAttempt {
    epoch: Epoch,
    outbound: mpsc::UnboundedSender<String>,
}

struct PendingCommand {
    epoch: Epoch,
    reply: CommandReply,
}

/// The actor driving one logical connection
pub struct ConnectionManager {
    machine: ConnectionMachine,
    connector: Arc<dyn Connector>,
    tracker: SubscriptionTracker,
    events: EventBus,
    liveness_timeout: Duration,
    commands: mpsc::UnboundedReceiver<ManagerCommand>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs: mpsc::UnboundedReceiver<Input>,
    host: Option<broadcast::Receiver<HostEvent>>,
    state: watch::Sender<ConnectionState>,
    outlet: mpsc::UnboundedSender<ManagerEvent>,
    attempt: Option<LiveAttempt>,
    handshake_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    pending: HashMap<Uuid, PendingCommand>,
}

impl ConnectionManager {
    /// Spawn the actor
    ///
    /// The manager starts disconnected; call [`ConnectionHandle::connect`].
    pub fn spawn(
        config: &SyncConfig,
        connector: Arc<dyn Connector>,
        tracker: SubscriptionTracker,
        events: EventBus,
        lifecycle: &HostLifecycle,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (outlet, manager_events) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::default());

        let manager = Self {
            machine: ConnectionMachine::from_config(config).with_host_active(lifecycle.is_active()),
            connector,
            tracker,
            events,
            liveness_timeout: config.liveness_timeout(),
            commands,
            inputs_tx,
            inputs,
            host: Some(lifecycle.subscribe()),
            state,
            outlet,
            attempt: None,
            handshake_timer: None,
            retry_timer: None,
            pending: HashMap::new(),
        };
        tokio::spawn(manager.run());

        let handle = ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (handle, manager_events)
    }

    async fn run(mut self) {
        tracing::debug!("connection manager started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ManagerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(input) = self.inputs.recv() => self.step(input),
                Some(event) = next_host_event(&mut self.host) => {
                    self.step(Input::Host { active: event.active });
                }
            }
        }

        self.step(Input::Disconnect);
        tracing::debug!("connection manager stopped");
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Connect => self.step(Input::Connect),
            ManagerCommand::Disconnect => self.step(Input::Disconnect),
            ManagerCommand::Send(frame) => {
                // Subscriptions made while offline are replayed on connect.
                if self.machine.is_established() {
                    self.transmit(&frame);
                } else {
                    tracing::trace!(kind = frame.kind(), "not connected, frame dropped");
                }
            }
            ManagerCommand::Command {
                request_id,
                frame,
                reply,
            } => {
                if !self.machine.is_established() || !self.transmit(&frame) {
                    let _ = reply.send(Err(CommandError::Delivery(
                        ConnectionError::NotConnected.to_string(),
                    )));
                    return;
                }
                // Forget callers that gave up waiting
                self.pending.retain(|_, pending| !pending.reply.is_closed());
                self.pending.insert(
                    request_id,
                    PendingCommand {
                        epoch: self.machine.epoch(),
                        reply,
                    },
                );
            }
            ManagerCommand::Shutdown => {}
        }
    }

    fn step(&mut self, input: Input) {
        for effect in self.machine.handle(input) {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Open { epoch } => {
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                tokio::spawn(run_attempt(
                    epoch,
                    self.connector.clone(),
                    outbound_rx,
                    self.inputs_tx.clone(),
                    self.liveness_timeout,
                ));
                self.attempt = Some(LiveAttempt { epoch, outbound });
            }
            Effect::Send { epoch, frame } => {
                if self.attempt.as_ref().is_some_and(|a| a.epoch == epoch) {
                    self.transmit(&frame);
                }
            }
            Effect::Close { epoch } => {
                // Dropping the sender makes the attempt task close its transport.
                if self.attempt.as_ref().is_some_and(|a| a.epoch == epoch) {
                    self.attempt = None;
                }
            }
            Effect::StartHandshakeTimer { epoch, timeout } => {
                let timer = self.arm(timeout, Input::HandshakeTimedOut { epoch });
                if let Some(previous) = self.handshake_timer.replace(timer) {
                    previous.abort();
                }
            }
            Effect::CancelHandshakeTimer => {
                if let Some(timer) = self.handshake_timer.take() {
                    timer.abort();
                }
            }
            Effect::ScheduleRetry { epoch, delay } => {
                let timer = self.arm(delay, Input::RetryTimerFired { epoch });
                if let Some(previous) = self.retry_timer.replace(timer) {
                    previous.abort();
                }
            }
            Effect::CancelRetry => {
                if let Some(timer) = self.retry_timer.take() {
                    timer.abort();
                }
            }
            Effect::Established { epoch, user_id } => {
                let frames = self.tracker.resubscribe_frames();
                tracing::debug!(epoch, topics = frames.len(), "replaying subscriptions");
                for frame in &frames {
                    self.transmit(frame);
                }
                let _ = self.outlet.send(ManagerEvent::Established { epoch, user_id });
            }
            Effect::Deliver { frame } => self.deliver(frame),
            Effect::AttemptEnded { epoch } => {
                self.attempt.take_if(|attempt| attempt.epoch == epoch);
                self.fail_pending(epoch);
            }
            Effect::StatusChanged { status, attempt } => {
                self.state.send_replace(ConnectionState {
                    status,
                    attempt,
                    epoch: self.machine.epoch(),
                });
                self.events
                    .publish(SyncEvent::ConnectionChanged { status, attempt });
            }
            Effect::Failed { error } => {
                let _ = self.outlet.send(ManagerEvent::Failed(error));
            }
        }
    }

    fn arm(&self, delay: Duration, input: Input) -> JoinHandle<()> {
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(input);
        })
    }

    fn transmit(&self, frame: &ClientFrame) -> bool {
        let Some(attempt) = &self.attempt else {
            return false;
        };

        match protocol::encode(frame) {
            Ok(text) => attempt.outbound.send(text).is_ok(),
            Err(e) => {
                tracing::error!(kind = frame.kind(), error = %e, "failed to serialize frame");
                false
            }
        }
    }

    fn deliver(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::CommandAck {
                request_id,
                version,
            } => match self.pending.remove(&request_id) {
                Some(pending) => {
                    let _ = pending.reply.send(Ok(CommandReceipt { version }));
                }
                None => tracing::debug!(%request_id, "acknowledgement for unknown command"),
            },
            ServerFrame::Error {
                code,
                message,
                request_id: Some(request_id),
            } if self.pending.contains_key(&request_id) => {
                if let Some(pending) = self.pending.remove(&request_id) {
                    let _ = pending.reply.send(Err(command_error(&code, message)));
                }
            }
            frame => {
                let _ = self.outlet.send(ManagerEvent::Frame(frame));
            }
        }
    }

    fn fail_pending(&mut self, epoch: Epoch) {
        let lost: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.epoch == epoch)
            .map(|(id, _)| *id)
            .collect();

        for request_id in lost {
            if let Some(pending) = self.pending.remove(&request_id) {
                tracing::debug!(%request_id, epoch, "connection lost before acknowledgement");
                let _ = pending.reply.send(Err(CommandError::Delivery(
                    "connection lost before acknowledgement".to_string(),
                )));
            }
        }
    }
}

/// Map a server error code answering a command
fn command_error(code: &str, message: String) -> CommandError {
    match code {
        "forbidden" => CommandError::Forbidden { message },
        "conflict" | "version_conflict" => CommandError::Conflict { message },
        _ => CommandError::Rejected {
            code: code.to_string(),
            message,
        },
    }
}

async fn next_host_event(host: &mut Option<broadcast::Receiver<HostEvent>>) -> Option<HostEvent> {
    let Some(receiver) = host.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        let received = receiver.recv().await;
        match received {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "host lifecycle events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                *host = None;
                return None;
            }
        }
    }
}

/// Own one transport for the lifetime of one attempt
///
/// Everything observed is reported as an [`Input`] tagged with `epoch`.
/// The task ends when the transport closes, stalls, or the manager drops
/// the outbound sender.
async fn run_attempt(
    epoch: Epoch,
    connector: Arc<dyn Connector>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inputs: mpsc::UnboundedSender<Input>,
    liveness_timeout: Duration,
) {
    let mut transport = match connector.connect().await {
        Ok(transport) => transport,
        Err(error) => {
            let _ = inputs.send(Input::OpenFailed { epoch, error });
            return;
        }
    };
    let _ = inputs.send(Input::Opened { epoch });

    let liveness = tokio::time::sleep(liveness_timeout);
    tokio::pin!(liveness);

    loop {
        tokio::select! {
            text = outbound.recv() => match text {
                Some(text) => {
                    if let Err(error) = transport.send(text).await {
                        let _ = inputs.send(Input::TransportError { epoch, error });
                    }
                }
                None => {
                    tracing::debug!(epoch, "closing retired transport");
                    transport.close().await;
                    return;
                }
            },
            incoming = transport.recv() => {
                liveness
                    .as_mut()
                    .reset(tokio::time::Instant::now() + liveness_timeout);
                match incoming {
                    Some(Ok(TransportMessage::Text(text))) => {
                        if let Some(frame) = protocol::decode(&text) {
                            let _ = inputs.send(Input::Frame { epoch, frame });
                        }
                    }
                    Some(Ok(TransportMessage::Heartbeat)) => {}
                    Some(Err(error)) => {
                        let _ = inputs.send(Input::TransportError { epoch, error });
                    }
                    None => {
                        let _ = inputs.send(Input::Closed { epoch });
                        return;
                    }
                }
            },
            _ = &mut liveness => {
                let _ = inputs.send(Input::Stalled { epoch });
                transport.close().await;
                return;
            }
        }
    }
}
