use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{MessageType, UserId},
    error::ErrorCode,
    protocol::UserSummary,
};
use tokio::net::TcpListener;

use super::*;
use crate::{
    credential::MissingTokenRefresher,
    test_support::{mint_token, mint_token_with_nonce, new_envelope},
};

#[derive(Clone)]
struct AuthServerState {
    accepted_token: Arc<StdMutex<String>>,
    next_token: String,
    refresh_fails: bool,
    refresh_calls: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
    served: Arc<AtomicUsize>,
    login_saw_bearer: Arc<AtomicBool>,
}

impl AuthServerState {
    fn new(accepted_token: String, next_token: String, refresh_fails: bool) -> Self {
        Self {
            accepted_token: Arc::new(StdMutex::new(accepted_token)),
            next_token,
            refresh_fails,
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(AtomicUsize::new(0)),
            served: Arc::new(AtomicUsize::new(0)),
            login_saw_bearer: Arc::new(AtomicBool::new(false)),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!(
            "Bearer {}",
            self.accepted_token.lock().expect("token lock")
        );
        let provided = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        provided == expected
    }
}

async fn handle_list_chats(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationPayload>>, StatusCode> {
    if !state.authorized(&headers) {
        state.rejected.fetch_add(1, Ordering::SeqCst);
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.served.fetch_add(1, Ordering::SeqCst);
    Ok(Json(vec![ConversationPayload {
        chat_id: ChatId::from("c1"),
        target: Some(UserSummary {
            id: UserId::from("u2"),
            username: "bob".into(),
            display_name: None,
        }),
        participants: Vec::new(),
        latest_message: None,
        updated_at: None,
        unread_count: 2,
    }]))
}

async fn handle_history(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<MessageEnvelope>>, (StatusCode, Json<ApiError>)> {
    if !state.authorized(&headers) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(ErrorCode::Unauthorized, "expired")),
        ));
    }
    if chat_id == "missing" {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(ErrorCode::NotFound, "no such chat")),
        ));
    }
    let page = query.get("page").cloned().unwrap_or_default();
    let size = query.get("size").cloned().unwrap_or_default();
    Ok(Json(vec![new_envelope(
        "m1",
        &chat_id,
        "u2",
        &format!("page={page} size={size}"),
        "2024-01-01T00:00:00Z",
    )]))
}

async fn handle_refresh(
    State(state): State<AuthServerState>,
    Json(_request): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, StatusCode> {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    if state.refresh_fails {
        return Err(StatusCode::UNAUTHORIZED);
    }
    *state.accepted_token.lock().expect("token lock") = state.next_token.clone();
    Ok(Json(AuthResponse {
        token: state.next_token.clone(),
        display_name: Some("Alice".into()),
    }))
}

async fn handle_login(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Json<AuthResponse> {
    if headers.contains_key(AUTHORIZATION) {
        state.login_saw_bearer.store(true, Ordering::SeqCst);
    }
    Json(AuthResponse {
        token: mint_token(&request.username, 3600),
        display_name: None,
    })
}

async fn spawn_auth_server(state: AuthServerState) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/api/chats", get(handle_list_chats))
        .route("/api/chats/:chat_id/messages", get(handle_history))
        .route("/api/auth/refresh", post(handle_refresh))
        .route("/api/auth/login", post(handle_login))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn client_with_token(server_url: &str, token: &str) -> (Arc<ApiClient>, Arc<CredentialCoordinator>) {
    let credentials = CredentialCoordinator::new(Arc::new(HttpTokenRefresher::new(server_url)));
    credentials.set_credential(Credential::from_token(token, None).expect("credential"));
    let api = Arc::new(ApiClient::new(server_url, Arc::clone(&credentials)));
    (api, credentials)
}

#[test]
fn public_allowlist_matches_auth_endpoints_only() {
    assert!(is_public_path("/api/auth/login"));
    assert!(is_public_path("/api/auth/refresh"));
    assert!(is_public_path("/api/auth/verify-email?token=abc"));
    assert!(!is_public_path("/api/chats"));
    assert!(!is_public_path("/api/messages/m1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unauthorized_requests_share_one_refresh_and_replay() {
    let stale = mint_token_with_nonce("u1", 3600, Some("stale"));
    let fresh = mint_token_with_nonce("u1", 3600, Some("fresh"));
    let state = AuthServerState::new(fresh.clone(), fresh.clone(), false);
    // The server only accepts `fresh`; the client starts with `stale`.
    let server_url = spawn_auth_server(state.clone()).await;
    let (api, credentials) = client_with_token(&server_url, &stale);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let api = Arc::clone(&api);
        tasks.push(tokio::spawn(async move { api.fetch_conversations().await }));
    }
    for task in tasks {
        let conversations = task.await.expect("join").expect("replayed request");
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].unread_count, 2);
    }

    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.rejected.load(Ordering::SeqCst), 5);
    assert_eq!(state.served.load(Ordering::SeqCst), 5);
    let live = credentials.credential().expect("credential");
    assert_eq!(live.access_token, fresh);
    assert_eq!(live.display_name, "Alice");
}

#[tokio::test]
async fn refresh_failure_ends_session_and_later_calls_fail_fast() {
    let stale = mint_token_with_nonce("u1", 3600, Some("stale"));
    let state = AuthServerState::new("never-matches".into(), String::new(), true);
    let server_url = spawn_auth_server(state.clone()).await;
    let (api, credentials) = client_with_token(&server_url, &stale);
    let mut changes = credentials.on_change();

    let err = api.fetch_conversations().await.expect_err("refresh fails");
    assert!(err.is_auth(), "unexpected error: {err}");
    assert!(credentials.credential().is_none());
    assert_eq!(
        changes.recv().await,
        Some(crate::credential::CredentialChange::Cleared(
            crate::credential::ClearReason::RefreshFailed
        ))
    );

    let err = api.fetch_conversations().await.expect_err("fail fast");
    assert!(matches!(err, SyncError::Auth(AuthError::NotAuthenticated)));
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn login_is_public_and_yields_decoded_credential() {
    let state = AuthServerState::new(String::new(), String::new(), false);
    let server_url = spawn_auth_server(state.clone()).await;
    let credentials = CredentialCoordinator::new(Arc::new(MissingTokenRefresher));
    // A stale credential must not leak onto the public endpoint.
    credentials.set_credential(
        Credential::from_token(mint_token("someone-else", 3600), None).expect("credential"),
    );
    let api = ApiClient::new(&server_url, credentials);

    let credential = api.login("alice", "secret").await.expect("login");
    assert_eq!(credential.subject_id, UserId::from("alice"));
    assert!(credential.is_valid());
    assert!(!state.login_saw_bearer.load(Ordering::SeqCst));
}

#[tokio::test]
async fn history_request_carries_page_and_size() {
    let token = mint_token("u1", 3600);
    let state = AuthServerState::new(token.clone(), token.clone(), false);
    let server_url = spawn_auth_server(state).await;
    let (api, _credentials) = client_with_token(&server_url, &token);

    let page = api
        .fetch_history(&ChatId::from("c1"), 2, 30)
        .await
        .expect("history");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content.as_deref(), Some("page=2 size=30"));
    assert_eq!(page[0].message_type, Some(MessageType::Text));
}

#[tokio::test]
async fn error_bodies_are_decoded_into_api_errors() {
    let token = mint_token("u1", 3600);
    let state = AuthServerState::new(token.clone(), token.clone(), false);
    let server_url = spawn_auth_server(state).await;
    let (api, _credentials) = client_with_token(&server_url, &token);

    let err = api
        .fetch_history(&ChatId::from("missing"), 0, 30)
        .await
        .expect_err("not found");
    match err {
        SyncError::Api { status, error } => {
            assert_eq!(status, 404);
            assert_eq!(error.code, ErrorCode::NotFound);
            assert_eq!(error.message, "no such chat");
        }
        other => panic!("unexpected error: {other}"),
    }
}
