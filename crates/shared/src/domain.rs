use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId, i64);
id_newtype!(RequestId, Uuid);
id_newtype!(ConnectionId, Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    /// Accepted and rejected are sinks; no transition leads back to pending.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

/// Which side of the mirrored pair a record lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
}

/// Event payloads carry the actor either as a bare id or as a populated
/// profile depending on the emitting path. Resolved into a `UserSummary`
/// exactly once at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sender {
    Populated(UserSummary),
    Id(UserId),
}

impl Sender {
    pub fn user_id(&self) -> UserId {
        match self {
            Self::Populated(summary) => summary.user_id,
            Self::Id(user_id) => *user_id,
        }
    }

    /// Normalize into `{id, name}`, falling back to the id's display form
    /// when the payload carried no profile.
    pub fn resolve(self) -> UserSummary {
        match self {
            Self::Populated(summary) => summary,
            Self::Id(user_id) => UserSummary {
                user_id,
                username: user_id.to_string(),
            },
        }
    }
}

/// One side of a mirrored friend-request pair. The logical request is the
/// two records sharing a `request_id`; both must carry the same status
/// after any successful transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestRecord {
    pub request_id: RequestId,
    pub direction: RequestDirection,
    pub other_user_id: UserId,
    pub other_username: String,
    pub message: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendSummary {
    pub user_id: UserId,
    pub username: String,
    pub friends_since: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_sinks() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(RequestStatus::Accepted.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
    }

    #[test]
    fn sender_resolves_bare_id_to_display_form() {
        let resolved = Sender::Id(UserId(42)).resolve();
        assert_eq!(resolved.user_id, UserId(42));
        assert_eq!(resolved.username, "42");
    }

    #[test]
    fn sender_deserializes_both_shapes() {
        let populated: Sender =
            serde_json::from_str(r#"{"user_id":7,"username":"mira"}"#).expect("populated");
        assert_eq!(
            populated.resolve(),
            UserSummary {
                user_id: UserId(7),
                username: "mira".to_string()
            }
        );

        let bare: Sender = serde_json::from_str("7").expect("bare");
        assert_eq!(bare.user_id(), UserId(7));
    }
}
