//! Versioned entity primitives shared by the cache, the codec and the coordinator
//!
//! Every authoritative state object handled by the engine is identified by an
//! [`EntityId`] and carries a server-assigned, monotonically increasing
//! [`Version`]. The cache stores one [`CacheEntry`] per entity and records where
//! the entry came from in its [`Provenance`].

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Stable identifier of a server-owned entity (one game)
pub type EntityId = i64;

/// Server-assigned entity version
pub type Version = i64;

/// A subscribable stream of updates on the live connection
///
/// Serialized the way the server expects it: `{"kind":"game","id":42}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    Game { id: EntityId },
}

impl Topic {
    pub fn game(id: EntityId) -> Self {
        Topic::Game { id }
    }

    /// The entity whose updates flow on this topic
    pub fn entity_id(&self) -> EntityId {
        match self {
            Topic::Game { id } => *id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Game { id } => write!(f, "game:{}", id),
        }
    }
}

/// Where a cache entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    /// Arrived over the live connection
    Push,
    /// Arrived through a snapshot fetch
    Http,
    /// Synthesized locally from the entry at `base`, not yet confirmed
    Optimistic { base: Version },
}

impl Provenance {
    /// Push and HTTP entries come from the server
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, Provenance::Optimistic { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Provenance::Push => "push",
            Provenance::Http => "http",
            Provenance::Optimistic { .. } => "optimistic",
        }
    }
}

/// Opaque cache validator (ETag) bound to one entity version
///
/// The server issues tokens shaped like `"game-42-v7"`, quotes included.
/// Tokens of that shape can be derived locally for pushed entries, which
/// keeps conditional fetches working after a push overwrote an HTTP entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatorToken(String);

impl ValidatorToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build the token the server would issue for `id` at `version`
    pub fn derive(id: EntityId, version: Version) -> Self {
        Self(format!("\"game-{}-v{}\"", id, version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract `(entity_id, version)` from a server-shaped token
    ///
    /// Weak validators (`W/"..."`) are accepted. Returns `None` for tokens
    /// that do not follow the `game-{id}-v{version}` shape.
    pub fn parse(&self) -> Option<(EntityId, Version)> {
        static ETAG_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = ETAG_REGEX
            .get_or_init(|| Regex::new(r#"^(?:W/)?"?game-(\d+)-v(\d+)"?$"#).unwrap());

        let captures = regex.captures(self.0.trim())?;
        let id = captures.get(1)?.as_str().parse().ok()?;
        let version = captures.get(2)?.as_str().parse().ok()?;
        Some((id, version))
    }

    pub fn version(&self) -> Option<Version> {
        self.parse().map(|(_, version)| version)
    }
}

impl fmt::Display for ValidatorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The reconciled state of one entity as held by the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_id: EntityId,
    pub version: Version,
    pub payload: serde_json::Value,
    pub provenance: Provenance,
    /// Always matches `version` when present
    pub validator: Option<ValidatorToken>,
    pub received_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry delivered over the live connection
    ///
    /// Pushes carry no validator, so one is derived from the version.
    pub fn push(entity_id: EntityId, version: Version, payload: serde_json::Value) -> Self {
        Self {
            entity_id,
            version,
            payload,
            provenance: Provenance::Push,
            validator: Some(ValidatorToken::derive(entity_id, version)),
            received_at: Utc::now(),
        }
    }

    /// An entry delivered by a snapshot fetch
    pub fn http(
        entity_id: EntityId,
        version: Version,
        payload: serde_json::Value,
        validator: Option<ValidatorToken>,
    ) -> Self {
        // A token naming another version would break conditional fetches.
        let validator = match validator {
            Some(token) if token.version().is_none_or(|v| v == version) => token,
            _ => ValidatorToken::derive(entity_id, version),
        };

        Self {
            entity_id,
            version,
            payload,
            provenance: Provenance::Http,
            validator: Some(validator),
            received_at: Utc::now(),
        }
    }

    /// Derive a speculative entry from this one
    ///
    /// The version is not advanced; the entry remembers it as its base.
    pub fn optimistic(&self, payload: serde_json::Value) -> Self {
        Self {
            entity_id: self.entity_id,
            version: self.version,
            payload,
            provenance: Provenance::Optimistic {
                base: self.base_version(),
            },
            validator: self.validator.clone(),
            received_at: Utc::now(),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        !self.provenance.is_authoritative()
    }

    /// The authoritative version this entry derives from
    pub fn base_version(&self) -> Version {
        match self.provenance {
            Provenance::Optimistic { base } => base,
            _ => self.version,
        }
    }
}
