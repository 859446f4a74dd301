//! Where commands go once they are applied locally

use crate::connection::ConnectionHandle;
use crate::core::entity::{CacheEntry, EntityId};
use crate::core::error::CommandError;
use crate::http::{CommandReceipt, CommandSubmitter};
use crate::protocol::GameAction;
use async_trait::async_trait;
use std::sync::Arc;

/// Delivers a command to the server
#[async_trait]
pub trait CommandDispatch: Send + Sync {
    /// Deliver `action`, issued against the entry `previous`
    async fn dispatch(
        &self,
        entity_id: EntityId,
        action: &GameAction,
        previous: &CacheEntry,
    ) -> Result<CommandReceipt, CommandError>;
}

/// Uses the live connection while it is up, HTTP otherwise
#[derive(Clone)]
pub struct RoutedDispatch {
    live: Option<ConnectionHandle>,
    http: Arc<dyn CommandSubmitter>,
}

impl RoutedDispatch {
    pub fn new(http: Arc<dyn CommandSubmitter>) -> Self {
        Self { live: None, http }
    }

    pub fn with_connection(mut self, live: ConnectionHandle) -> Self {
        self.live = Some(live);
        self
    }
}

#[async_trait]
impl CommandDispatch for RoutedDispatch {
    async fn dispatch(
        &self,
        entity_id: EntityId,
        action: &GameAction,
        previous: &CacheEntry,
    ) -> Result<CommandReceipt, CommandError> {
        match &self.live {
            Some(live) if live.is_connected() => {
                tracing::debug!(entity_id, command = action.command_name(), "dispatching over live connection");
                live.send_command(entity_id, previous.version, action.clone())
                    .await
            }
            _ => {
                tracing::debug!(entity_id, command = action.command_name(), "dispatching over http");
                self.http
                    .submit(entity_id, action, previous.validator.as_ref())
                    .await
            }
        }
    }
}
