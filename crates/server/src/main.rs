use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::{
    accept_request, cancel_request, list_friends, list_requests, reject_request, remove_friend,
    run_consistency_sweep, send_request, ApiContext, Fanout,
};
use shared::{
    domain::{RequestId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ApiResponse, ClientMessage, FriendListData, RequestListData, SendRequestBody,
        SendRequestData, ServerEvent,
    },
};
use storage::Storage;
use tracing::{debug, error, info, warn};

mod auth;
mod config;
mod registry;

use auth::AuthKeys;
use config::{load_settings, prepare_database_url};
use registry::RoomRegistry;

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    registry: Arc<RoomRegistry>,
    auth: AuthKeys,
}

type ErrorReply = (StatusCode, Json<ApiResponse<serde_json::Value>>);

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext { storage };
    let state = Arc::new(AppState {
        api,
        registry: Arc::new(RoomRegistry::default()),
        auth: AuthKeys::from_secret(&settings.auth_secret),
    });

    spawn_sweep_task(state.clone(), settings.sweep_interval_seconds);

    let app = build_router(state);
    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/friends", get(http_list_friends))
        .route("/friends/requests", get(http_list_requests))
        .route("/friends/request/:user_id", post(http_send_request))
        .route("/friends/accept/:request_id", post(http_accept_request))
        .route("/friends/reject/:request_id", post(http_reject_request))
        .route("/friends/cancel/:request_id", post(http_cancel_request))
        .route("/friends/:user_id", delete(http_remove_friend))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn spawn_sweep_task(state: Arc<AppState>, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        // First tick fires immediately; divergence left by a crash gets
        // repaired at startup rather than one interval later.
        loop {
            ticker.tick().await;
            match run_consistency_sweep(&state.api).await {
                Ok(0) => {}
                Ok(repaired) => info!(repaired, "consistency sweep repaired divergent requests"),
                Err(error) => warn!(error = %error.message, "consistency sweep failed"),
            }
        }
    });
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "unhealthy"),
    }
}

/// Development login: upserts the user and hands back a signed token. In
/// production tokens come from the main auth service and this route is
/// kept behind the deployment proxy.
async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ErrorReply> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(error_reply(ApiError::new(
            ErrorCode::Validation,
            "username cannot be empty",
        )));
    }
    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(|e| error_reply(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    let token = state
        .auth
        .issue_token(user_id)
        .map_err(|e| error_reply(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(LoginResponse {
        user_id: user_id.0,
        token,
    }))
}

async fn http_list_friends(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<FriendListData>>, ErrorReply> {
    let user_id = bearer_user(&state, &headers)?;
    let friends = list_friends(&state.api, user_id)
        .await
        .map_err(error_reply)?;
    Ok(Json(ApiResponse::ok("friends", FriendListData { friends })))
}

async fn http_list_requests(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<RequestListData>>, ErrorReply> {
    let user_id = bearer_user(&state, &headers)?;
    let (sent, received) = list_requests(&state.api, user_id)
        .await
        .map_err(error_reply)?;
    Ok(Json(ApiResponse::ok(
        "friend requests",
        RequestListData { sent, received },
    )))
}

async fn http_send_request(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<SendRequestBody>>,
) -> Result<Json<ApiResponse<SendRequestData>>, ErrorReply> {
    let sender_id = bearer_user(&state, &headers)?;
    let message = body.and_then(|Json(b)| b.message);
    let (request_id, fanout) = send_request(&state.api, sender_id, UserId(recipient_id), message)
        .await
        .map_err(error_reply)?;
    deliver(&state, fanout).await;
    Ok(Json(ApiResponse::ok(
        "friend request sent",
        SendRequestData { request_id },
    )))
}

async fn http_accept_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<RequestId>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<serde_json::Value>>, ErrorReply> {
    let user_id = bearer_user(&state, &headers)?;
    let fanout = accept_request(&state.api, request_id, user_id)
        .await
        .map_err(error_reply)?;
    deliver(&state, fanout).await;
    Ok(Json(ApiResponse::ok(
        "friend request accepted",
        serde_json::json!({}),
    )))
}

async fn http_reject_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<RequestId>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<serde_json::Value>>, ErrorReply> {
    let user_id = bearer_user(&state, &headers)?;
    let fanout = reject_request(&state.api, request_id, user_id)
        .await
        .map_err(error_reply)?;
    deliver(&state, fanout).await;
    Ok(Json(ApiResponse::ok(
        "friend request rejected",
        serde_json::json!({}),
    )))
}

async fn http_cancel_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<RequestId>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<serde_json::Value>>, ErrorReply> {
    let user_id = bearer_user(&state, &headers)?;
    cancel_request(&state.api, request_id, user_id)
        .await
        .map_err(error_reply)?;
    Ok(Json(ApiResponse::ok(
        "friend request cancelled",
        serde_json::json!({}),
    )))
}

async fn http_remove_friend(
    State(state): State<Arc<AppState>>,
    Path(friend_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<serde_json::Value>>, ErrorReply> {
    let user_id = bearer_user(&state, &headers)?;
    let fanout = remove_friend(&state.api, user_id, UserId(friend_id))
        .await
        .map_err(error_reply)?;
    deliver(&state, fanout).await;
    Ok(Json(ApiResponse::ok(
        "friend removed",
        serde_json::json!({}),
    )))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

/// Socket lifecycle: the client gets one authenticate frame and a short
/// deadline before the server gives up on the handshake. After a
/// successful handshake the connection only ever receives events; all
/// mutations go through REST.
async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();

    let user_id = match tokio::time::timeout(AUTH_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Authenticate { user_id, token })
                if state.auth.verify_token(&token) == Some(user_id) =>
            {
                user_id
            }
            Ok(ClientMessage::Authenticate { user_id, .. }) => {
                debug!(user_id = user_id.0, "socket presented an invalid token");
                send_auth_error(&mut sender, "invalid token").await;
                return;
            }
            Err(_) => {
                send_auth_error(&mut sender, "malformed authenticate frame").await;
                return;
            }
        },
        Ok(_) => {
            send_auth_error(&mut sender, "expected an authenticate frame").await;
            return;
        }
        Err(_) => {
            send_auth_error(&mut sender, "authentication timed out").await;
            return;
        }
    };

    let authenticated = ServerEvent::Authenticated { success: true };
    if let Ok(text) = serde_json::to_string(&authenticated) {
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let (connection_id, mut events_rx) = state.registry.register(user_id);
    info!(user_id = user_id.0, %connection_id, "socket authenticated");

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.registry.deregister(user_id, connection_id);
    info!(user_id = user_id.0, %connection_id, "socket closed");
}

async fn send_auth_error<S>(sender: &mut S, message: &str)
where
    S: futures::Sink<axum::extract::ws::Message> + Unpin,
{
    use axum::extract::ws::Message;
    use futures::SinkExt;

    let event = ServerEvent::AuthError {
        success: false,
        error: message.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&event) {
        let _ = sender.send(Message::Text(text)).await;
    }
}

/// Best-effort delivery of post-transition notifications. Offline targets
/// are skipped; the store is the durable truth and the client converges
/// on its next authoritative fetch.
async fn deliver(state: &AppState, fanout: Vec<Fanout>) {
    for notification in fanout {
        let delivered = state
            .registry
            .emit_to_user(notification.target, notification.event)
            .await;
        if !delivered {
            debug!(
                user_id = notification.target.0,
                "recipient offline, event dropped"
            );
        }
    }
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, ErrorReply> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            error_reply(ApiError::new(ErrorCode::Unauthorized, "missing bearer token"))
        })?;
    state
        .auth
        .verify_token(token)
        .ok_or_else(|| error_reply(ApiError::new(ErrorCode::Unauthorized, "invalid token")))
}

fn error_reply(error: ApiError) -> ErrorReply {
    let status = match error.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PreconditionFailed => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Transport
        | ErrorCode::PartialWrite
        | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::err(error.message)))
}
