use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

pub(crate) type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct Connection {
    user_id: UserId,
    sender: EventSender,
}

#[derive(Default)]
struct PresenceInner {
    connections: HashMap<ConnectionId, Connection>,
    by_user: BTreeMap<UserId, BTreeSet<ConnectionId>>,
}

impl PresenceInner {
    fn online_users(&self) -> Vec<UserId> {
        self.by_user.keys().copied().collect()
    }

    fn broadcast(&self, event: &ServerEvent) {
        for (connection_id, connection) in &self.connections {
            if connection.sender.send(event.clone()).is_err() {
                debug!(%connection_id, "presence: writer already closed");
            }
        }
    }
}

/// Live websocket connections grouped by user.
#[derive(Default)]
pub(crate) struct PresenceRegistry {
    inner: RwLock<PresenceInner>,
    next_connection: AtomicU64,
}

impl PresenceRegistry {
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Returns true when this is the user's first live connection.
    pub(crate) async fn register_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        sender: EventSender,
    ) -> bool {
        let mut inner = self.inner.write().await;
        inner
            .connections
            .insert(connection_id, Connection { user_id, sender });
        let devices = inner.by_user.entry(user_id).or_default();
        devices.insert(connection_id);
        let came_online = devices.len() == 1;

        if came_online {
            let user_ids = inner.online_users();
            info!(
                user_id = user_id.0,
                %connection_id,
                online = user_ids.len(),
                "presence: user online"
            );
            inner.broadcast(&ServerEvent::OnlineUsersUpdated { user_ids });
        } else {
            debug!(user_id = user_id.0, %connection_id, "presence: additional device");
        }
        came_online
    }

    /// Returns true when the user's last connection went away.
    pub(crate) async fn unregister_connection(&self, connection_id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(connection) = inner.connections.remove(&connection_id) else {
            return false;
        };
        let user_id = connection.user_id;
        let went_offline = match inner.by_user.get_mut(&user_id) {
            Some(devices) => {
                devices.remove(&connection_id);
                devices.is_empty()
            }
            None => false,
        };

        if went_offline {
            inner.by_user.remove(&user_id);
            let user_ids = inner.online_users();
            info!(
                user_id = user_id.0,
                %connection_id,
                online = user_ids.len(),
                "presence: user offline"
            );
            inner.broadcast(&ServerEvent::OnlineUsersUpdated { user_ids });
        }
        went_offline
    }

    pub(crate) async fn online_users(&self) -> Vec<UserId> {
        self.inner.read().await.online_users()
    }

    pub(crate) async fn request_snapshot(&self, connection_id: ConnectionId) -> bool {
        let inner = self.inner.read().await;
        let user_ids = inner.online_users();
        inner
            .connections
            .get(&connection_id)
            .map(|connection| {
                connection
                    .sender
                    .send(ServerEvent::OnlineUsersUpdated { user_ids })
                    .is_ok()
            })
            .unwrap_or(false)
    }

    pub(crate) async fn connections_for(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .map(|devices| devices.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn sender(&self, connection_id: ConnectionId) -> Option<EventSender> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|connection| connection.sender.clone())
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
