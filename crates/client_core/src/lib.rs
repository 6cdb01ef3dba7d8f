use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use shared::{
    domain::{FriendRequestRecord, FriendSummary, RequestId, UserId},
    protocol::{
        ApiResponse, ClientMessage, FriendListData, RequestListData, SendRequestBody,
        SendRequestData, ServerEvent,
    },
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

pub mod cache;
pub mod dedup;
pub mod session;

use cache::{FriendsSnapshot, ReconciliationCache};
use dedup::{DeduplicationStore, ToastDeduper};
use session::{Directive, SessionConfig, SessionStateMachine};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("server refused the request: {0}")]
    Api(String),
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

/// REST surface of the friends service. A trait seam so the client's
/// event pipeline can be exercised against an in-memory double.
#[async_trait]
pub trait FriendsBackend: Send + Sync {
    async fn fetch_friends(&self) -> Result<Vec<FriendSummary>, BackendError>;
    async fn fetch_requests(
        &self,
    ) -> Result<(Vec<FriendRequestRecord>, Vec<FriendRequestRecord>), BackendError>;
    async fn send_request(
        &self,
        recipient_id: UserId,
        message: Option<String>,
    ) -> Result<RequestId, BackendError>;
    async fn accept_request(&self, request_id: RequestId) -> Result<(), BackendError>;
    async fn reject_request(&self, request_id: RequestId) -> Result<(), BackendError>;
    async fn cancel_request(&self, request_id: RequestId) -> Result<(), BackendError>;
    async fn remove_friend(&self, friend_id: UserId) -> Result<(), BackendError>;
}

pub struct HttpFriendsBackend {
    http: Client,
    server_url: String,
    token: String,
}

impl HttpFriendsBackend {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            token: token.into(),
        }
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response: ApiResponse<T> = self
            .http
            .get(format!("{}{path}", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        unwrap_envelope(response)
    }

    async fn post_data<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&SendRequestBody>,
    ) -> Result<T, BackendError> {
        let mut request = self
            .http
            .post(format!("{}{path}", self.server_url))
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response: ApiResponse<T> = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        unwrap_envelope(response)
    }
}

fn unwrap_envelope<T>(response: ApiResponse<T>) -> Result<T, BackendError> {
    if !response.success {
        return Err(BackendError::Api(response.message));
    }
    response
        .data
        .ok_or_else(|| BackendError::Api("response envelope carried no data".to_string()))
}

#[async_trait]
impl FriendsBackend for HttpFriendsBackend {
    async fn fetch_friends(&self) -> Result<Vec<FriendSummary>, BackendError> {
        let data: FriendListData = self.get_data("/friends").await?;
        Ok(data.friends)
    }

    async fn fetch_requests(
        &self,
    ) -> Result<(Vec<FriendRequestRecord>, Vec<FriendRequestRecord>), BackendError> {
        let data: RequestListData = self.get_data("/friends/requests").await?;
        Ok((data.sent, data.received))
    }

    async fn send_request(
        &self,
        recipient_id: UserId,
        message: Option<String>,
    ) -> Result<RequestId, BackendError> {
        let body = SendRequestBody { message };
        let data: SendRequestData = self
            .post_data(&format!("/friends/request/{recipient_id}"), Some(&body))
            .await?;
        Ok(data.request_id)
    }

    async fn accept_request(&self, request_id: RequestId) -> Result<(), BackendError> {
        let _: serde_json::Value = self
            .post_data(&format!("/friends/accept/{request_id}"), None)
            .await?;
        Ok(())
    }

    async fn reject_request(&self, request_id: RequestId) -> Result<(), BackendError> {
        let _: serde_json::Value = self
            .post_data(&format!("/friends/reject/{request_id}"), None)
            .await?;
        Ok(())
    }

    async fn cancel_request(&self, request_id: RequestId) -> Result<(), BackendError> {
        let _: serde_json::Value = self
            .post_data(&format!("/friends/cancel/{request_id}"), None)
            .await?;
        Ok(())
    }

    async fn remove_friend(&self, friend_id: UserId) -> Result<(), BackendError> {
        let response: ApiResponse<serde_json::Value> = self
            .http
            .delete(format!("{}/friends/{friend_id}", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        unwrap_envelope(response).map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    AuthFailed(String),
    Disconnected { recoverable: bool },
    FriendsUpdated(FriendsSnapshot),
    Notification {
        title: String,
        body: String,
        kind: String,
    },
    Error(String),
}

struct ClientInner {
    dedup: DeduplicationStore,
    toasts: ToastDeduper,
    cache: ReconciliationCache,
}

/// Client-side core of the friends feature: REST mutations, the socket
/// event pipeline, deduplication and the reconciliation cache. Push
/// events never edit cached state directly; an event that survives
/// deduplication schedules a full refetch and the snapshot replaces the
/// cache wholesale.
pub struct SocialClient {
    backend: Arc<dyn FriendsBackend>,
    inner: Mutex<ClientInner>,
    events: broadcast::Sender<ClientEvent>,
}

impl SocialClient {
    pub fn new(backend: Arc<dyn FriendsBackend>) -> Arc<Self> {
        Self::with_dedup(backend, DeduplicationStore::default())
    }

    /// The deduplication store is injected so its window is a decision of
    /// the embedding application, not a global.
    pub fn with_dedup(backend: Arc<dyn FriendsBackend>, dedup: DeduplicationStore) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            backend,
            inner: Mutex::new(ClientInner {
                dedup,
                toasts: ToastDeduper::default(),
                cache: ReconciliationCache::default(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn cached_snapshot(&self) -> Option<FriendsSnapshot> {
        self.inner.lock().await.cache.snapshot().cloned()
    }

    pub async fn is_degraded(&self) -> bool {
        self.inner.lock().await.cache.is_degraded()
    }

    /// Authoritative fetch of friends plus both request lists. On success
    /// the cache is replaced and subscribers get the fresh snapshot; on
    /// failure the last snapshot stays served with the degraded flag up.
    pub async fn refresh(&self) -> Result<FriendsSnapshot> {
        let fetched = async {
            let friends = self.backend.fetch_friends().await?;
            let (sent, received) = self.backend.fetch_requests().await?;
            Ok::<_, BackendError>(FriendsSnapshot {
                friends,
                sent,
                received,
            })
        }
        .await;

        match fetched {
            Ok(snapshot) => {
                self.inner.lock().await.cache.apply_full(snapshot.clone());
                let _ = self.events.send(ClientEvent::FriendsUpdated(snapshot.clone()));
                Ok(snapshot)
            }
            Err(err) => {
                self.inner.lock().await.cache.mark_degraded();
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("friends refresh failed: {err}")));
                Err(err.into())
            }
        }
    }

    pub async fn send_friend_request(
        &self,
        recipient_id: UserId,
        message: Option<String>,
    ) -> Result<RequestId> {
        let request_id = self.backend.send_request(recipient_id, message).await?;
        let _ = self.refresh().await;
        Ok(request_id)
    }

    pub async fn accept_friend_request(&self, request_id: RequestId) -> Result<()> {
        self.backend.accept_request(request_id).await?;
        let _ = self.refresh().await;
        Ok(())
    }

    pub async fn reject_friend_request(&self, request_id: RequestId) -> Result<()> {
        self.backend.reject_request(request_id).await?;
        let _ = self.refresh().await;
        Ok(())
    }

    pub async fn cancel_friend_request(&self, request_id: RequestId) -> Result<()> {
        self.backend.cancel_request(request_id).await?;
        let _ = self.refresh().await;
        Ok(())
    }

    pub async fn remove_friend(&self, friend_id: UserId) -> Result<()> {
        self.backend.remove_friend(friend_id).await?;
        let _ = self.refresh().await;
        Ok(())
    }

    /// Entry point for pushed events, from the live socket or replayed
    /// after a reconnect. Drops duplicates, shows at most one toast per
    /// rendered notification, then reconciles through a full refetch.
    pub async fn ingest_event(&self, event: ServerEvent) {
        let Some(key) = event.idempotency_key() else {
            return;
        };
        {
            let mut inner = self.inner.lock().await;
            if !inner.dedup.should_process(&key) {
                debug!(%key, "duplicate event dropped");
                return;
            }
        }

        if let Some((title, body, kind)) = toast_for(&event) {
            let show = {
                let mut inner = self.inner.lock().await;
                inner.toasts.should_show(&title, &body, &kind)
            };
            if show {
                let _ = self
                    .events
                    .send(ClientEvent::Notification { title, body, kind });
            }
        }

        if let Err(err) = self.refresh().await {
            warn!(%err, "post-event refresh failed; cache marked degraded");
        }
    }

    pub fn spawn_socket(
        self: &Arc<Self>,
        server_url: &str,
        user_id: UserId,
        token: &str,
        config: SessionConfig,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let ws_url = ws_url_for(server_url)?;
        let client = Arc::clone(self);
        let token = token.to_string();
        Ok(tokio::spawn(async move {
            client.run_socket(ws_url, user_id, token, config).await;
        }))
    }

    async fn run_socket(
        self: Arc<Self>,
        ws_url: String,
        user_id: UserId,
        token: String,
        config: SessionConfig,
    ) {
        let mut machine = SessionStateMachine::new(config);
        loop {
            let generation = machine.begin();
            let directive = self
                .connect_once(&mut machine, generation, &ws_url, user_id, &token, config)
                .await;
            match directive {
                Directive::Reconnect { after } => tokio::time::sleep(after).await,
                Directive::Close => {
                    let _ = self
                        .events
                        .send(ClientEvent::Disconnected { recoverable: false });
                    break;
                }
                Directive::None => break,
            }
        }
    }

    async fn connect_once(
        &self,
        machine: &mut SessionStateMachine,
        generation: u64,
        ws_url: &str,
        user_id: UserId,
        token: &str,
        config: SessionConfig,
    ) -> Directive {
        let (stream, _) = match connect_async(ws_url).await {
            Ok(connected) => connected,
            Err(err) => {
                warn!(%err, "websocket connect failed");
                return machine.dropped(generation, true);
            }
        };
        machine.socket_opened(generation);
        let (mut writer, mut reader) = stream.split();

        let handshake = ClientMessage::Authenticate {
            user_id,
            token: token.to_string(),
        };
        let frame = match serde_json::to_string(&handshake) {
            Ok(text) => text,
            Err(_) => return machine.dropped(generation, false),
        };
        if writer.send(Message::Text(frame)).await.is_err() {
            return machine.dropped(generation, true);
        }

        let ack = tokio::time::timeout(config.auth_ack_timeout, async {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::Authenticated { success: true }) => {
                            return Some(Ok(()));
                        }
                        Ok(ServerEvent::AuthError { error, .. }) => return Some(Err(error)),
                        Ok(_) | Err(_) => continue,
                    },
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        })
        .await;

        match ack {
            Ok(Some(Ok(()))) => {
                machine.authenticated(generation);
                let _ = self.events.send(ClientEvent::Connected);
            }
            Ok(Some(Err(error))) => {
                let _ = self.events.send(ClientEvent::AuthFailed(error));
                return machine.auth_rejected(generation);
            }
            Ok(None) => return machine.dropped(generation, true),
            Err(_) => return machine.auth_timed_out(generation),
        }

        // Anything pushed while this client was offline is only in the
        // store; one authoritative fetch after the handshake covers it.
        if let Err(err) = self.refresh().await {
            warn!(%err, "post-connect refresh failed");
        }

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => self.ingest_event(event).await,
                    Err(err) => {
                        let _ = self
                            .events
                            .send(ClientEvent::Error(format!("invalid server event: {err}")));
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "websocket receive failed");
                    break;
                }
            }
        }

        let _ = self
            .events
            .send(ClientEvent::Disconnected { recoverable: true });
        machine.dropped(generation, true)
    }
}

/// Renders an event into toast content, resolving the actor into a
/// `{id, name}` summary exactly once. Handshake frames never render.
fn toast_for(event: &ServerEvent) -> Option<(String, String, String)> {
    match event {
        ServerEvent::NewFriendRequest {
            sender, message, ..
        } => {
            let who = sender.clone().resolve();
            let body = if message.is_empty() {
                format!("{} wants to be friends", who.username)
            } else {
                format!("{}: {}", who.username, message)
            };
            Some(("Friend request".to_string(), body, "friend-request".to_string()))
        }
        ServerEvent::FriendRequestAccepted { acceptor, .. } => {
            let who = acceptor.clone().resolve();
            Some((
                "Request accepted".to_string(),
                format!("{} accepted your friend request", who.username),
                "friend-accepted".to_string(),
            ))
        }
        ServerEvent::FriendRequestRejected { rejected_by, .. } => {
            let who = rejected_by.clone().resolve();
            Some((
                "Request declined".to_string(),
                format!("{} declined your friend request", who.username),
                "friend-rejected".to_string(),
            ))
        }
        ServerEvent::FriendRemoved { removed_by, .. } => {
            let who = removed_by.clone().resolve();
            Some((
                "Friend removed".to_string(),
                format!("{} removed you from their friends", who.username),
                "friend-removed".to_string(),
            ))
        }
        ServerEvent::Authenticated { .. } | ServerEvent::AuthError { .. } => None,
    }
}

fn ws_url_for(server_url: &str) -> Result<String> {
    let parsed = url::Url::parse(server_url).context("invalid server url")?;
    let ws_base = match parsed.scheme() {
        "https" => server_url.replacen("https://", "wss://", 1),
        "http" => server_url.replacen("http://", "ws://", 1),
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    Ok(format!("{}/ws", ws_base.trim_end_matches('/')))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
