use std::{collections::HashMap, sync::Mutex};

use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::mpsc;
use tracing::debug;

const PER_CONNECTION_BUFFER: usize = 64;

struct Entry {
    connection_id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

/// Maps each online user to their single live socket. At most one
/// connection per user: a fresh registration replaces the previous entry,
/// and the replaced connection's sender is dropped so its forward loop
/// winds down.
#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<HashMap<UserId, Entry>>,
}

impl RoomRegistry {
    pub fn register(&self, user_id: UserId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let connection_id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(PER_CONNECTION_BUFFER);
        let previous = self
            .inner
            .lock()
            .expect("registry lock")
            .insert(user_id, Entry { connection_id, tx });
        if previous.is_some() {
            debug!(user_id = user_id.0, "replacing existing connection");
        }
        (connection_id, rx)
    }

    /// Removes the user's entry only when it still belongs to the given
    /// connection. A disconnect racing a reconnect must not tear down the
    /// newer socket's registration.
    pub fn deregister(&self, user_id: UserId, connection_id: ConnectionId) {
        let mut map = self.inner.lock().expect("registry lock");
        if map
            .get(&user_id)
            .is_some_and(|entry| entry.connection_id == connection_id)
        {
            map.remove(&user_id);
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .contains_key(&user_id)
    }

    /// Delivers an event to the user's live socket. Returns false without
    /// doing anything when the user is offline; the store already holds
    /// the state and the client reconciles on its next fetch.
    pub async fn emit_to_user(&self, user_id: UserId, event: ServerEvent) -> bool {
        let tx = {
            let map = self.inner.lock().expect("registry lock");
            match map.get(&user_id) {
                Some(entry) => entry.tx.clone(),
                None => return false,
            }
        };
        tx.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::ServerEvent;

    fn test_event() -> ServerEvent {
        ServerEvent::Authenticated { success: true }
    }

    #[tokio::test]
    async fn emit_to_offline_user_is_a_noop() {
        let registry = RoomRegistry::default();
        assert!(!registry.emit_to_user(UserId(1), test_event()).await);
    }

    #[tokio::test]
    async fn emit_reaches_the_registered_connection() {
        let registry = RoomRegistry::default();
        let (_connection_id, mut rx) = registry.register(UserId(1));

        assert!(registry.emit_to_user(UserId(1), test_event()).await);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn stale_deregister_leaves_the_newer_connection_in_place() {
        let registry = RoomRegistry::default();
        let (old_connection, _old_rx) = registry.register(UserId(1));
        let (_new_connection, mut new_rx) = registry.register(UserId(1));

        registry.deregister(UserId(1), old_connection);
        assert!(registry.is_online(UserId(1)));
        assert!(registry.emit_to_user(UserId(1), test_event()).await);
        assert!(new_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn matching_deregister_takes_the_user_offline() {
        let registry = RoomRegistry::default();
        let (connection_id, _rx) = registry.register(UserId(1));

        registry.deregister(UserId(1), connection_id);
        assert!(!registry.is_online(UserId(1)));
        assert!(!registry.emit_to_user(UserId(1), test_event()).await);
    }
}
