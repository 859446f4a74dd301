//! Request/response collaborators: snapshot fetches, command submission and
//! connection tokens
//!
//! The engine talks to these through traits so tests can substitute
//! in-process fakes; [`HttpApi`] is the `reqwest` implementation of all
//! three.

pub mod client;

pub use client::{HttpApi, ProblemDetails};

use crate::core::entity::{CacheEntry, EntityId, ValidatorToken, Version};
use crate::core::error::{CommandError, FetchError, SyncError};
use crate::protocol::GameAction;
use async_trait::async_trait;

/// Result of a conditional snapshot fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The validator still matches; the cached entry is current
    NotModified,
    /// A full snapshot (provenance `http`)
    Modified(CacheEntry),
}

/// Loads the full state of an entity
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fetch `entity_id`, conditionally when `validator` is given
    async fn fetch(
        &self,
        entity_id: EntityId,
        validator: Option<&ValidatorToken>,
    ) -> Result<FetchOutcome, FetchError>;
}

/// What the server said about an accepted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandReceipt {
    /// Version produced by the command, when the server reports it
    pub version: Option<Version>,
}

/// Submits commands over request/response
#[async_trait]
pub trait CommandSubmitter: Send + Sync {
    /// Submit `action`, guarded by the validator of the version it was issued against
    async fn submit(
        &self,
        entity_id: EntityId,
        action: &GameAction,
        if_match: Option<&ValidatorToken>,
    ) -> Result<CommandReceipt, CommandError>;
}

/// Issues short-lived credentials for the live connection
///
/// A [`SessionError`](crate::core::error::SessionError) means the user must
/// authenticate again; any other error is retried with backoff.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String, SyncError>;
}
