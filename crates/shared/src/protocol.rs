use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FriendRequestRecord, FriendSummary, RequestId, Sender, UserId};

/// Messages a client sends over the socket. The only one today is the
/// authentication handshake; every mutation goes through REST.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate { user_id: UserId, token: String },
}

/// Whether an event was emitted directly by a server-side transition or
/// re-emitted from a client-observed change. Used to break echo loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    #[default]
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    Authenticated {
        success: bool,
    },
    #[serde(rename = "auth_error")]
    AuthError {
        success: bool,
        error: String,
    },
    NewFriendRequest {
        sender: Sender,
        message: String,
        request_id: RequestId,
        recipient_id: UserId,
        timestamp: DateTime<Utc>,
    },
    FriendRequestAccepted {
        acceptor: Sender,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        source: EventSource,
    },
    FriendRequestRejected {
        rejected_by: Sender,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
    },
    FriendRemoved {
        removed_by: Sender,
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::AuthError { .. } => "auth_error",
            Self::NewFriendRequest { .. } => "new-friend-request",
            Self::FriendRequestAccepted { .. } => "friend-request-accepted",
            Self::FriendRequestRejected { .. } => "friend-request-rejected",
            Self::FriendRemoved { .. } => "friend-removed",
        }
    }

    /// Key identifying the logical event for deduplication. `kind` plus
    /// `request_id` where one exists; friend removal has no request, so
    /// its key is the remover plus the emission timestamp.
    pub fn idempotency_key(&self) -> Option<String> {
        match self {
            Self::NewFriendRequest { request_id, .. }
            | Self::FriendRequestAccepted { request_id, .. }
            | Self::FriendRequestRejected { request_id, .. } => {
                Some(format!("{}:{}", self.kind(), request_id))
            }
            Self::FriendRemoved {
                removed_by,
                timestamp,
            } => Some(format!(
                "{}:{}:{}",
                self.kind(),
                removed_by.user_id(),
                timestamp.timestamp_millis()
            )),
            Self::Authenticated { .. } | Self::AuthError { .. } => None,
        }
    }
}

/// REST envelope: every friends endpoint answers `{success, message, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SendRequestBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendListData {
    pub friends: Vec<FriendSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestListData {
    pub sent: Vec<FriendRequestRecord>,
    pub received: Vec<FriendRequestRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequestData {
    pub request_id: RequestId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserSummary;

    #[test]
    fn server_events_use_wire_names() {
        let event = ServerEvent::NewFriendRequest {
            sender: Sender::Populated(UserSummary {
                user_id: UserId(1),
                username: "ash".to_string(),
            }),
            message: "gg".to_string(),
            request_id: RequestId::generate(),
            recipient_id: UserId(2),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "new-friend-request");
    }

    #[test]
    fn idempotency_key_is_kind_plus_request_id() {
        let request_id = RequestId::generate();
        let event = ServerEvent::FriendRequestAccepted {
            acceptor: Sender::Id(UserId(3)),
            request_id,
            timestamp: Utc::now(),
            source: EventSource::Server,
        };
        assert_eq!(
            event.idempotency_key().expect("key"),
            format!("friend-request-accepted:{request_id}")
        );
    }

    // The envelope must deserialize for payload types without a Default
    // impl, and a missing data field must come through as None.
    #[test]
    fn envelope_data_is_optional_for_any_payload_type() {
        let parsed: ApiResponse<SendRequestData> =
            serde_json::from_str(r#"{"success":false,"message":"no such user"}"#).expect("parse");
        assert!(!parsed.success);
        assert!(parsed.data.is_none());
    }

    #[test]
    fn handshake_events_have_no_idempotency_key() {
        assert!(ServerEvent::Authenticated { success: true }
            .idempotency_key()
            .is_none());
    }
}
