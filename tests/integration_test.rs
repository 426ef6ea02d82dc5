// Integration tests for the pickup client
//
// These tests run the full stack (reqwest transport, token store, refresh
// coordinator, retrier) against a local mock booking API.

use clap::Parser;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use pickup_client::auth::{SqliteTokenStorage, TokenStorage};
use pickup_client::config::{CliArgs, Config};
use pickup_client::{ApiError, AuthHttpClient, ErrorKind, TokenPair, TokenStore};

// ==================================================================================================
// Mock API
// ==================================================================================================

struct ApiState {
    /// Access token the API currently accepts
    valid_access: Mutex<String>,
    /// Refresh token the API currently accepts
    valid_refresh: Mutex<String>,
    /// Pair handed out by the next successful refresh
    next_pair: Mutex<Option<(String, String)>>,
    /// Refresh responses wait until this many 401s have been served
    hold_refresh_until: usize,
    refresh_calls: AtomicUsize,
    unauthorized_served: AtomicUsize,
}

impl ApiState {
    fn new(valid_access: &str, next_pair: Option<(&str, &str)>, hold_refresh_until: usize) -> Arc<Self> {
        Arc::new(Self {
            valid_access: Mutex::new(valid_access.to_string()),
            valid_refresh: Mutex::new("R1".to_string()),
            next_pair: Mutex::new(next_pair.map(|(a, r)| (a.to_string(), r.to_string()))),
            hold_refresh_until,
            refresh_calls: AtomicUsize::new(0),
            unauthorized_served: AtomicUsize::new(0),
        })
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

async fn handle_orders(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let expected = format!("Bearer {}", state.valid_access.lock().unwrap());
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if presented == expected {
        Json(json!({"orders": [{"id": 1, "bins": 2, "frequency": "weekly"}]})).into_response()
    } else {
        state.unauthorized_served.fetch_add(1, Ordering::SeqCst);
        (StatusCode::UNAUTHORIZED, "token expired").into_response()
    }
}

async fn handle_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "5")],
        "too many requests",
    )
        .into_response()
}

async fn handle_refresh(State(state): State<Arc<ApiState>>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);

    // Let every concurrent original request be rejected before answering
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.unauthorized_served.load(Ordering::SeqCst) < state.hold_refresh_until
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Give the client time to park the late callers on the in-flight refresh
    tokio::time::sleep(Duration::from_millis(50)).await;

    let presented = body["refreshToken"].as_str().unwrap_or_default().to_string();
    if presented != *state.valid_refresh.lock().unwrap() {
        return (StatusCode::UNAUTHORIZED, "invalid refresh token").into_response();
    }

    let Some((access, refresh)) = state.next_pair.lock().unwrap().take() else {
        return (StatusCode::BAD_REQUEST, "invalid_grant").into_response();
    };

    *state.valid_access.lock().unwrap() = access.clone();
    *state.valid_refresh.lock().unwrap() = refresh.clone();
    Json(json!({"accessToken": access, "refreshToken": refresh})).into_response()
}

struct MockApi {
    url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockApi {
    async fn start(state: Arc<ApiState>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route("/api/orders", get(handle_orders))
            .route("/api/limited", get(handle_limited))
            .route("/api/auth/refresh", post(handle_refresh))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            url: format!("http://127.0.0.1:{}/api", port),
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn client_for(api: &MockApi, store: Arc<TokenStore>) -> AuthHttpClient {
    let args = CliArgs::try_parse_from([
        "pickup-client",
        "--api-url",
        api.url.as_str(),
        "--ephemeral",
        "status",
    ])
    .unwrap();
    let (config, _) = Config::from_args(args).unwrap();
    config.validate().unwrap();
    AuthHttpClient::from_config(&config, store).unwrap()
}

fn logged_in_store() -> Arc<TokenStore> {
    let store = Arc::new(TokenStore::in_memory());
    store.set_tokens(TokenPair::new("A1", "R1"));
    store
}

// ==================================================================================================
// Session Refresh Tests
// ==================================================================================================

#[tokio::test]
async fn test_valid_session_needs_no_refresh() {
    let state = ApiState::new("A1", None, 0);
    let api = MockApi::start(state.clone()).await;
    let client = client_for(&api, logged_in_store());

    let body: Value = client.get_json("/orders").await.unwrap();

    assert_eq!(body["orders"][0]["frequency"], "weekly");
    assert_eq!(state.refresh_calls(), 0);
}

#[tokio::test]
async fn test_three_concurrent_401s_share_one_refresh() {
    let state = ApiState::new("A2", Some(("A2", "R2")), 3);
    let api = MockApi::start(state.clone()).await;
    let store = logged_in_store();
    let client = Arc::new(client_for(&api, store.clone()));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get_json::<Value>("orders").await })
        })
        .collect();

    for handle in handles {
        let body = handle.await.unwrap().unwrap();
        assert_eq!(body["orders"][0]["id"], 1);
    }

    assert_eq!(state.refresh_calls(), 1);
    assert_eq!(store.tokens(), Some(TokenPair::new("A2", "R2")));
    assert!(!store.is_session_expired());

    // Requests issued after the cycle use the new token directly
    client.get_json::<Value>("orders").await.unwrap();
    assert_eq!(state.refresh_calls(), 1);
    assert_eq!(state.unauthorized_served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_failed_refresh_expires_session_for_all_waiters() {
    let state = ApiState::new("A2", None, 3);
    let api = MockApi::start(state.clone()).await;
    let store = logged_in_store();
    let client = Arc::new(client_for(&api, store.clone()));
    let mut expired = store.subscribe();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get_json::<Value>("orders").await })
        })
        .collect();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnauthorizedTerminal);
        assert!(err.requires_login());
    }

    assert_eq!(state.refresh_calls(), 1);
    assert!(store.is_session_expired());
    assert!(store.tokens().is_none());
    assert!(*expired.borrow_and_update());
}

#[tokio::test]
async fn test_rate_limit_is_surfaced_without_refresh() {
    let state = ApiState::new("A1", Some(("A2", "R2")), 0);
    let api = MockApi::start(state.clone()).await;
    let client = client_for(&api, logged_in_store());

    let request = client.request(reqwest::Method::GET, "limited").unwrap();
    let err = client.send(request).await.unwrap_err();

    match err {
        ApiError::RateLimited { retry_after, .. } => assert_eq!(retry_after, Some(5)),
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert_eq!(state.refresh_calls(), 0);
}

#[tokio::test]
async fn test_no_refresh_token_fails_fast() {
    let state = ApiState::new("A2", Some(("A2", "R2")), 0);
    let api = MockApi::start(state.clone()).await;
    let store = Arc::new(TokenStore::in_memory());
    let client = client_for(&api, store.clone());

    let err = client.get_json::<Value>("orders").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnauthorizedTerminal);
    assert_eq!(state.refresh_calls(), 0);
    assert!(store.is_session_expired());
}

#[tokio::test]
async fn test_refreshed_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("session.db");
    let state = ApiState::new("A2", Some(("A2", "R2")), 0);
    let api = MockApi::start(state.clone()).await;

    {
        let storage: Arc<dyn TokenStorage> = Arc::new(SqliteTokenStorage::open(&db).unwrap());
        let store = Arc::new(TokenStore::open(storage).unwrap());
        let client = client_for(&api, store.clone());
        client.login(TokenPair::new("A1", "R1"));
        client.get_json::<Value>("orders").await.unwrap();
    }

    let storage: Arc<dyn TokenStorage> = Arc::new(SqliteTokenStorage::open(&db).unwrap());
    let store = Arc::new(TokenStore::open(storage).unwrap());
    assert_eq!(store.tokens(), Some(TokenPair::new("A2", "R2")));

    let client = client_for(&api, store);
    client.get_json::<Value>("orders").await.unwrap();
    assert_eq!(state.refresh_calls(), 1);
}
