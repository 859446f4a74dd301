//! `reqwest` implementation of the request/response collaborators
//!
//! - `GET  {api}/api/games/{id}/snapshot` with `If-None-Match`, answered by
//!   `304` or `200` + `ETag: "game-{id}-v{version}"`
//! - `POST {api}/api/games/{id}/{bid|trump|play|ready}` with `If-Match`
//! - `GET  {api}{token_path}` returning `{"token": "...", "expires_in": 90}`
//!
//! Error responses are RFC 7807 problem documents.

use super::{CommandReceipt, CommandSubmitter, FetchOutcome, SnapshotFetcher, TokenProvider};
use crate::config::SyncConfig;
use crate::core::entity::{CacheEntry, EntityId, ValidatorToken, Version};
use crate::core::error::{CommandError, FetchError, SessionError, SyncError, TransportError};
use crate::protocol::GameAction;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, ETAG, HeaderMap, IF_MATCH, IF_NONE_MATCH};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

/// RFC 7807 error body
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProblemDetails {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl ProblemDetails {
    fn message(&self, status: StatusCode) -> String {
        self.detail
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| status.to_string())
    }

    fn code_or(&self, fallback: &str) -> String {
        self.code.clone().unwrap_or_else(|| fallback.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// HTTP client for the game API
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    config: SyncConfig,
    bearer: Option<String>,
}

impl HttpApi {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            bearer: None,
        }
    }

    /// Authenticate every request with `Authorization: Bearer <token>`
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn problem(response: Response) -> ProblemDetails {
        response.json().await.unwrap_or_default()
    }
}

/// Snapshots are stored as `{"game": …, "viewer": …}`, the shape pushed
/// over the live connection. Bare snapshots are wrapped.
fn normalize_snapshot(body: Value) -> Value {
    if body.get("viewer").is_some() {
        body
    } else {
        json!({ "game": body, "viewer": null })
    }
}

fn body_version(body: &Value) -> Option<Version> {
    body.get("version").and_then(Value::as_i64)
}

fn etag(headers: &HeaderMap) -> Option<ValidatorToken> {
    headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(ValidatorToken::new)
}

#[async_trait]
impl SnapshotFetcher for HttpApi {
    async fn fetch(
        &self,
        entity_id: EntityId,
        validator: Option<&ValidatorToken>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut request = self
            .authorize(self.client.get(self.config.snapshot_url(entity_id)))
            .timeout(self.config.fetch_timeout());
        if let Some(token) = validator {
            request = request.header(IF_NONE_MATCH, token.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    timeout_ms: self.config.fetch_timeout_ms,
                }
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::NotModified),
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound { entity_id }),
            StatusCode::UNAUTHORIZED => return Err(SessionError::Expired.into()),
            s if !s.is_success() => {
                return Err(FetchError::Status {
                    status: s.as_u16(),
                });
            }
            _ => {}
        }

        let validator = etag(response.headers());
        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        let version = validator
            .as_ref()
            .and_then(ValidatorToken::version)
            .or_else(|| body_version(&body))
            .ok_or_else(|| FetchError::Decode("snapshot carries no version".to_string()))?;

        tracing::debug!(entity_id, version, "snapshot fetched");
        Ok(FetchOutcome::Modified(CacheEntry::http(
            entity_id,
            version,
            normalize_snapshot(body),
            validator,
        )))
    }
}

#[async_trait]
impl CommandSubmitter for HttpApi {
    async fn submit(
        &self,
        entity_id: EntityId,
        action: &GameAction,
        if_match: Option<&ValidatorToken>,
    ) -> Result<CommandReceipt, CommandError> {
        let url = self.config.command_url(entity_id, action.command_name());
        let mut request = self
            .authorize(self.client.post(url))
            .timeout(self.config.command_timeout())
            .json(&action.http_body());
        if let Some(token) = if_match {
            request = request.header(IF_MATCH, token.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CommandError::Timeout {
                    timeout_ms: self.config.command_timeout_ms,
                }
            } else {
                CommandError::Delivery(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            let etag_version = etag(response.headers()).and_then(|t| t.version());
            let reported = response
                .json::<Value>()
                .await
                .ok()
                .as_ref()
                .and_then(body_version);
            return Ok(CommandReceipt {
                version: etag_version.or(reported),
            });
        }

        let problem = Self::problem(response).await;
        let message = problem.message(status);
        tracing::debug!(
            entity_id,
            status = status.as_u16(),
            code = ?problem.code,
            trace_id = ?problem.trace_id,
            "command refused"
        );

        Err(match status {
            StatusCode::CONFLICT => CommandError::Conflict { message },
            StatusCode::UNAUTHORIZED => SessionError::Expired.into(),
            StatusCode::FORBIDDEN => CommandError::Forbidden { message },
            StatusCode::PRECONDITION_REQUIRED => CommandError::Rejected {
                code: problem.code_or("PRECONDITION_REQUIRED"),
                message,
            },
            s if s.is_client_error() => CommandError::Rejected {
                code: problem.code_or("BAD_REQUEST"),
                message,
            },
            s => CommandError::Server {
                status: s.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl TokenProvider for HttpApi {
    async fn fetch_token(&self) -> Result<String, SyncError> {
        let response = self
            .authorize(self.client.get(self.config.token_url()))
            .timeout(self.config.fetch_timeout())
            .send()
            .await
            .map_err(|e| TransportError::Connect(format!("token request failed: {}", e)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SessionError::Expired.into());
            }
            s if !s.is_success() => {
                return Err(TransportError::Connect(format!("token endpoint answered {}", s)).into());
            }
            _ => {}
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::TokenUnavailable(e.to_string()))?;
        tracing::debug!(expires_in = ?body.expires_in, "connection token issued");
        Ok(body.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_wraps_bare_snapshot() {
        let bare = json!({"game": {"round_no": 1}, "phase": {"phase": "Init"}});
        assert_eq!(
            normalize_snapshot(bare.clone()),
            json!({"game": bare, "viewer": null})
        );

        let wrapped = json!({"game": {}, "viewer": {"seat": 2}});
        assert_eq!(normalize_snapshot(wrapped.clone()), wrapped);
    }

    #[test]
    fn test_problem_details_message_fallbacks() {
        let problem: ProblemDetails = serde_json::from_value(json!({
            "type": "https://errors/conflict",
            "title": "Conflict",
            "status": 409,
            "code": "OPTIMISTIC_LOCK",
            "trace_id": "abc"
        }))
        .unwrap();
        assert_eq!(problem.message(StatusCode::CONFLICT), "Conflict");
        assert_eq!(problem.code_or("X"), "OPTIMISTIC_LOCK");

        let empty = ProblemDetails::default();
        assert_eq!(empty.message(StatusCode::CONFLICT), "409 Conflict");
    }
}
