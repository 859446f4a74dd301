//! Integration tests for the reqwest collaborators
//!
//! A small axum app plays the game API: conditional snapshots with ETags,
//! If-Match guarded commands answering RFC 7807 problems, and the
//! connection-token endpoint.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use realtime::config::SyncConfig;
use realtime::core::entity::ValidatorToken;
use realtime::core::error::{CommandError, FetchError, SessionError, SyncError};
use realtime::http::{CommandSubmitter, FetchOutcome, HttpApi, SnapshotFetcher, TokenProvider};
use realtime::protocol::GameAction;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

const GAME: i64 = 7;

#[derive(Clone)]
struct GameServer {
    version: Arc<Mutex<i64>>,
    bids: Arc<Mutex<Vec<Value>>>,
}

fn etag(version: i64) -> String {
    format!("\"game-{}-v{}\"", GAME, version)
}

fn problem(status: StatusCode, code: &str, detail: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(json!({
            "type": format!("https://errors/{}", code.to_lowercase()),
            "title": status.canonical_reason(),
            "status": status.as_u16(),
            "detail": detail,
            "code": code,
            "trace_id": "test-trace"
        })),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer session-1")
}

async fn snapshot(
    State(server): State<GameServer>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if id != GAME {
        return problem(StatusCode::NOT_FOUND, "GAME_NOT_FOUND", "no such game");
    }
    let version = *server.version.lock().unwrap();

    let presented = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if presented == Some(etag(version).as_str()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let body = json!({
        "game": {"round_no": 1, "dealer": 0, "seating": [1, 2, 3, 4], "scores_total": [0, 0, 0, 0]},
        "phase": {"phase": "Bidding", "data": {"to_act": 1, "bids": [null, null, null, null]}}
    });
    ([(header::ETAG, etag(version))], Json(body)).into_response()
}

async fn bid(
    State(server): State<GameServer>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if id != GAME {
        return problem(StatusCode::NOT_FOUND, "GAME_NOT_FOUND", "no such game");
    }
    if !authorized(&headers) {
        return problem(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "log in again");
    }

    let mut version = server.version.lock().unwrap();
    match headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        None => problem(
            StatusCode::PRECONDITION_REQUIRED,
            "PRECONDITION_REQUIRED",
            "If-Match header required",
        ),
        Some(tag) if tag != etag(*version) => {
            problem(StatusCode::CONFLICT, "OPTIMISTIC_LOCK", "game has moved on")
        }
        Some(_) if body["bid"].as_u64().is_none_or(|b| b > 13) => {
            problem(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_BID", "bid out of range")
        }
        Some(_) => {
            *version += 1;
            server.bids.lock().unwrap().push(body);
            (
                [(header::ETAG, etag(*version))],
                Json(json!({"version": *version})),
            )
                .into_response()
        }
    }
}

async fn ready() -> Response {
    problem(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        "database unavailable",
    )
}

async fn token(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"token": "ws-token-1", "expires_in": 90})).into_response()
}

async fn start_server(version: i64) -> (SocketAddr, GameServer) {
    let server = GameServer {
        version: Arc::new(Mutex::new(version)),
        bids: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/api/games/{id}/snapshot", get(snapshot))
        .route("/api/games/{id}/bid", post(bid))
        .route("/api/games/{id}/ready", post(ready))
        .route("/api/ws/token", get(token))
        .with_state(server.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, server)
}

fn api(addr: SocketAddr) -> HttpApi {
    let config = SyncConfig::for_endpoints(format!("http://{}", addr), format!("ws://{}/ws", addr));
    HttpApi::new(config).with_bearer_token("session-1")
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_then_not_modified() {
    let (addr, _server) = start_server(5).await;
    let api = api(addr);

    let FetchOutcome::Modified(entry) = api.fetch(GAME, None).await.unwrap() else {
        panic!("expected a full snapshot");
    };
    assert_eq!(entry.version, 5);
    assert_eq!(entry.validator, Some(ValidatorToken::new(etag(5))));
    // Bare snapshots are stored in the pushed shape
    assert_eq!(entry.payload["viewer"], Value::Null);
    assert_eq!(entry.payload["game"]["phase"]["phase"], "Bidding");

    let again = api.fetch(GAME, entry.validator.as_ref()).await.unwrap();
    assert_eq!(again, FetchOutcome::NotModified);
}

#[tokio::test]
async fn test_snapshot_after_change_is_modified() {
    let (addr, server) = start_server(5).await;
    let api = api(addr);

    *server.version.lock().unwrap() = 6;
    let outdated = ValidatorToken::derive(GAME, 5);
    match api.fetch(GAME, Some(&outdated)).await.unwrap() {
        FetchOutcome::Modified(entry) => assert_eq!(entry.version, 6),
        FetchOutcome::NotModified => panic!("validator should not match"),
    }
}

#[tokio::test]
async fn test_unknown_game() {
    let (addr, _server) = start_server(1).await;
    assert_eq!(
        api(addr).fetch(99, None).await,
        Err(FetchError::NotFound { entity_id: 99 })
    );
}

#[tokio::test]
async fn test_unreachable_server_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    assert!(matches!(
        api(addr).fetch(GAME, None).await,
        Err(FetchError::Network(_))
    ));
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_command_with_matching_validator() {
    let (addr, server) = start_server(5).await;

    let receipt = api(addr)
        .submit(
            GAME,
            &GameAction::Bid { bid: 3 },
            Some(&ValidatorToken::derive(GAME, 5)),
        )
        .await
        .unwrap();

    assert_eq!(receipt.version, Some(6));
    assert_eq!(server.bids.lock().unwrap().clone(), vec![json!({"bid": 3})]);
}

#[tokio::test]
async fn test_command_against_stale_version_conflicts() {
    let (addr, server) = start_server(8).await;

    let result = api(addr)
        .submit(
            GAME,
            &GameAction::Bid { bid: 3 },
            Some(&ValidatorToken::derive(GAME, 5)),
        )
        .await;

    assert_eq!(
        result,
        Err(CommandError::Conflict {
            message: "game has moved on".into()
        })
    );
    assert!(server.bids.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_command_without_validator_is_rejected() {
    let (addr, _server) = start_server(5).await;

    match api(addr).submit(GAME, &GameAction::Bid { bid: 3 }, None).await {
        Err(CommandError::Rejected { code, .. }) => assert_eq!(code, "PRECONDITION_REQUIRED"),
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_validation_failure_keeps_server_code() {
    let (addr, _server) = start_server(5).await;

    let result = api(addr)
        .submit(
            GAME,
            &GameAction::Bid { bid: 40 },
            Some(&ValidatorToken::derive(GAME, 5)),
        )
        .await;
    assert_eq!(
        result,
        Err(CommandError::Rejected {
            code: "INVALID_BID".into(),
            message: "bid out of range".into()
        })
    );
}

#[tokio::test]
async fn test_command_without_session() {
    let (addr, _server) = start_server(5).await;
    let config = SyncConfig::for_endpoints(format!("http://{}", addr), format!("ws://{}/ws", addr));

    let result = HttpApi::new(config)
        .submit(
            GAME,
            &GameAction::Bid { bid: 3 },
            Some(&ValidatorToken::derive(GAME, 5)),
        )
        .await;
    assert_eq!(result, Err(CommandError::Session(SessionError::Expired)));
}

#[tokio::test]
async fn test_server_failure() {
    let (addr, _server) = start_server(5).await;

    let result = api(addr)
        .submit(GAME, &GameAction::Ready { is_ready: true }, None)
        .await;
    assert_eq!(
        result,
        Err(CommandError::Server {
            status: 500,
            message: "database unavailable".into()
        })
    );
}

// ============================================================================
// Connection tokens
// ============================================================================

#[tokio::test]
async fn test_token_issued() {
    let (addr, _server) = start_server(1).await;
    assert_eq!(api(addr).fetch_token().await.unwrap(), "ws-token-1");
}

#[tokio::test]
async fn test_token_refused_means_session_expired() {
    let (addr, _server) = start_server(1).await;
    let config = SyncConfig::for_endpoints(format!("http://{}", addr), format!("ws://{}/ws", addr));

    assert_eq!(
        HttpApi::new(config).fetch_token().await,
        Err(SyncError::Session(SessionError::Expired))
    );
}
