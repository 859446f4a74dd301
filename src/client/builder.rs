//! SyncClientBuilder for assembling a client from its collaborators

use super::{Router, SyncClient, SyncStatus};
use crate::cache::{Resynchronizer, StateCache};
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::core::events::EventBus;
use crate::core::lifecycle::HostLifecycle;
use crate::http::{CommandSubmitter, HttpApi, SnapshotFetcher, TokenProvider};
use crate::mutation::{OptimisticCoordinator, RoutedDispatch};
use crate::subscription::SubscriptionTracker;
use crate::transport::{Connector, WebSocketConnector};
use crate::turn::TurnDetector;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};

/// Builder for [`SyncClient`]
///
/// Every collaborator defaults to the network implementation derived from
/// the configuration: [`HttpApi`] for snapshots, commands and tokens, and a
/// [`WebSocketConnector`] authenticated through the token endpoint.
///
/// # Example
///
/// ```ignore
/// let client = SyncClientBuilder::new()
///     .with_config(config)
///     .with_bearer_token(token)
///     .build()?;
/// ```
#[derive(Default)]
pub struct SyncClientBuilder {
    config: Option<SyncConfig>,
    connector: Option<Arc<dyn Connector>>,
    fetcher: Option<Arc<dyn SnapshotFetcher>>,
    submitter: Option<Arc<dyn CommandSubmitter>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    bearer_token: Option<String>,
    lifecycle: Option<HostLifecycle>,
}

impl SyncClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (defaults to [`SyncConfig::default_config`])
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the live connection transport
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_snapshot_fetcher(mut self, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_command_submitter(mut self, submitter: Arc<dyn CommandSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Session credential sent as `Authorization: Bearer` on HTTP requests
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Use an isolated lifecycle registry instead of the process-wide one
    pub fn with_lifecycle(mut self, lifecycle: HostLifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Build the client and start its background tasks
    ///
    /// Must be called from within a Tokio runtime. The client starts
    /// disconnected.
    pub fn build(self) -> Result<SyncClient> {
        tokio::runtime::Handle::try_current()
            .context("SyncClient must be built inside a Tokio runtime")?;

        let config = self.config.unwrap_or_else(SyncConfig::default_config);
        config.check()?;

        let mut api = HttpApi::new(config.clone());
        if let Some(token) = self.bearer_token {
            api = api.with_bearer_token(token);
        }
        let api = Arc::new(api);

        let fetcher = self
            .fetcher
            .unwrap_or_else(|| api.clone() as Arc<dyn SnapshotFetcher>);
        let submitter = self
            .submitter
            .unwrap_or_else(|| api.clone() as Arc<dyn CommandSubmitter>);
        let tokens = self
            .tokens
            .unwrap_or_else(|| api.clone() as Arc<dyn TokenProvider>);
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(WebSocketConnector::new(config.ws_url.clone()).with_token_provider(tokens))
                as Arc<dyn Connector>
        });
        let lifecycle = self
            .lifecycle
            .unwrap_or_else(|| HostLifecycle::global().clone());

        let events = EventBus::new(config.event_capacity);
        let cache = StateCache::new(events.clone());
        let tracker = SubscriptionTracker::new();
        let status = SyncStatus::new(events.clone());

        let (connection, inbound) = ConnectionManager::spawn(
            &config,
            connector,
            tracker.clone(),
            events.clone(),
            &lifecycle,
        );

        let resync = Resynchronizer::new(cache.clone(), fetcher, config.fetch_timeout());
        let dispatch = RoutedDispatch::new(submitter).with_connection(connection.clone());
        let coordinator = OptimisticCoordinator::new(
            cache.clone(),
            Arc::new(dispatch),
            resync.clone(),
            config.command_timeout(),
            config.confirm_timeout(),
        );
        let turns = TurnDetector::new(cache.clone(), events.clone());

        let resync_task = Arc::new(Mutex::new(None));
        let router = Router {
            cache: cache.clone(),
            tracker: tracker.clone(),
            resync: resync.clone(),
            turns: turns.clone(),
            status: status.clone(),
            events: events.clone(),
            resync_task: resync_task.clone(),
        };
        let tasks = vec![tokio::spawn(router.run(inbound)), turns.spawn()];

        tracing::debug!(api = %config.api_base_url, ws = %config.ws_url, "sync client built");

        Ok(SyncClient {
            config,
            events,
            cache,
            tracker,
            connection,
            resync,
            coordinator,
            turns,
            status,
            tasks,
            resync_task,
        })
    }
}
