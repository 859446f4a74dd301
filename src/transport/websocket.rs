//! WebSocket transport over `tokio-tungstenite`

use super::{Connector, Transport, TransportMessage};
use crate::core::error::{SessionError, SyncError, TransportError};
use crate::http::TokenProvider;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections, authenticating each with a fresh token
///
/// Tokens are short-lived, so one is requested per attempt and passed as
/// the `token` query parameter.
#[derive(Clone)]
pub struct WebSocketConnector {
    url: String,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tokens: None,
        }
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    async fn endpoint(&self) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| TransportError::Connect(format!("invalid url '{}': {}", self.url, e)))?;

        if let Some(tokens) = &self.tokens {
            let token = tokens.fetch_token().await?;
            url.query_pairs_mut().append_pair("token", &token);
        }
        Ok(url)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        let url = self.endpoint().await?;

        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                tracing::debug!(url = %self.url, "websocket opened");
                Ok(Box::new(WebSocketTransport { stream }))
            }
            Err(WsError::Http(response)) if response.status().as_u16() == 401 => {
                Err(SessionError::Expired.into())
            }
            Err(e) => Err(TransportError::Connect(e.to_string()).into()),
        }
    }
}

struct WebSocketTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(TransportMessage::Text(text.to_string()))),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(TransportMessage::Text(text))),
                    Err(_) => tracing::debug!("dropping non-UTF-8 binary frame"),
                },
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) => {
                    return Some(Ok(TransportMessage::Heartbeat));
                }
                Message::Close(frame) => {
                    tracing::debug!(?frame, "server closed websocket");
                    return None;
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "error while closing websocket");
        }
    }
}
