//! In-memory transport for testing and development
//!
//! Every successful [`connect`](Connector::connect) hands the matching
//! [`ServerEnd`] to whoever holds the acceptor receiver, which can then play
//! the server: read client frames, push server frames, or hang up.

use super::{Connector, Transport, TransportMessage};
use crate::core::error::{SyncError, TransportError};
use crate::protocol::{ClientFrame, ServerFrame};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Connector producing channel-backed transports
#[derive(Debug)]
pub struct InMemoryConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    refusals: Mutex<VecDeque<SyncError>>,
    attempts: AtomicUsize,
}

impl InMemoryConnector {
    /// Create a connector and the receiver of accepted server ends
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, acceptor) = mpsc::unbounded_channel();
        let connector = Self {
            accepted,
            refusals: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        };
        (connector, acceptor)
    }

    /// Make the next connection attempt fail with `error`
    ///
    /// Calls queue up: each one fails one further attempt.
    pub fn refuse_next(&self, error: SyncError) {
        self.refusals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// Number of connection attempts so far (refused ones included)
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refusal = self
            .refusals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = refusal {
            return Err(error);
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        self.accepted
            .send(ServerEnd {
                incoming: from_client,
                outgoing: to_client,
            })
            .map_err(|_| TransportError::Connect("no acceptor".to_string()))?;

        Ok(Box::new(InMemoryTransport {
            outgoing: Some(to_server),
            incoming: from_server,
        }))
    }
}

struct InMemoryTransport {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<TransportMessage>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(text)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.outgoing.take();
        self.incoming.close();
    }
}

/// The server side of an in-memory connection
///
/// Dropping it closes the connection for the client.
#[derive(Debug)]
pub struct ServerEnd {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<TransportMessage>,
}

impl ServerEnd {
    /// Next raw text sent by the client, `None` once it closed
    pub async fn recv_text(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Next decodable client frame, `None` once the client closed
    pub async fn recv_frame(&mut self) -> Option<ClientFrame> {
        while let Some(text) = self.incoming.recv().await {
            if let Ok(frame) = serde_json::from_str(&text) {
                return Some(frame);
            }
        }
        None
    }

    /// Send raw text; false if the client is gone
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing
            .send(TransportMessage::Text(text.into()))
            .is_ok()
    }

    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    pub fn heartbeat(&self) -> bool {
        self.outgoing.send(TransportMessage::Heartbeat).is_ok()
    }

    /// Read the client's `hello` and acknowledge it
    pub async fn accept_handshake(&mut self, user_id: i64) -> Option<u32> {
        match self.recv_frame().await? {
            ClientFrame::Hello { protocol } => {
                self.send_frame(&ServerFrame::HelloAck {
                    protocol: Some(protocol),
                    user_id: Some(user_id),
                });
                Some(protocol)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (connector, mut acceptor) = InMemoryConnector::new();
        let mut transport = connector.connect().await.unwrap();
        let mut server = acceptor.recv().await.unwrap();

        transport
            .send(r#"{"type":"hello","protocol":1}"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            server.recv_frame().await,
            Some(ClientFrame::Hello { protocol: 1 })
        );

        server.heartbeat();
        server.send_text("hi");
        assert_eq!(
            transport.recv().await,
            Some(Ok(TransportMessage::Heartbeat))
        );
        assert_eq!(
            transport.recv().await,
            Some(Ok(TransportMessage::Text("hi".into())))
        );

        drop(server);
        assert_eq!(transport.recv().await, None);
    }

    #[tokio::test]
    async fn test_client_close_is_visible_to_server() {
        let (connector, mut acceptor) = InMemoryConnector::new();
        let mut transport = connector.connect().await.unwrap();
        let mut server = acceptor.recv().await.unwrap();

        transport.close().await;
        assert_eq!(server.recv_text().await, None);
        assert!(transport.send("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_refusals_are_consumed_in_order() {
        let (connector, _acceptor) = InMemoryConnector::new();
        connector.refuse_next(TransportError::Connect("one".into()).into());

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }
}
