use chrono::{DateTime, Utc};
use shared::domain::{FriendRequestRecord, FriendSummary, RequestId, UserId};

/// One authoritative fetch of the social graph as the server sees it.
#[derive(Debug, Clone, Default)]
pub struct FriendsSnapshot {
    pub friends: Vec<FriendSummary>,
    pub sent: Vec<FriendRequestRecord>,
    pub received: Vec<FriendRequestRecord>,
}

/// Read-through cache over the server's friend state. Push events never
/// write into this cache; they schedule a refetch and the fetched
/// snapshot replaces the whole thing. Entries therefore only disappear
/// on a full refresh, and a failed refresh leaves the last good snapshot
/// in place with the degraded flag raised.
#[derive(Debug, Default)]
pub struct ReconciliationCache {
    snapshot: Option<FriendsSnapshot>,
    fetched_at: Option<DateTime<Utc>>,
    degraded: bool,
}

impl ReconciliationCache {
    pub fn snapshot(&self) -> Option<&FriendsSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    /// True when the cached snapshot may be stale because the most recent
    /// refresh attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn apply_full(&mut self, snapshot: FriendsSnapshot) {
        self.snapshot = Some(snapshot);
        self.fetched_at = Some(Utc::now());
        self.degraded = false;
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn is_friend(&self, user_id: UserId) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|s| s.friends.iter().any(|f| f.user_id == user_id))
    }

    pub fn has_received_request(&self, request_id: RequestId) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|s| s.received.iter().any(|r| r.request_id == request_id))
    }
}
