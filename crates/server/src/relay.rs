use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use shared::{
    domain::{CallId, ConnectionId, RoomId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::presence::PresenceRegistry;

#[derive(Default)]
struct Rooms {
    members: HashMap<RoomId, BTreeSet<ConnectionId>>,
    joined: HashMap<ConnectionId, BTreeSet<RoomId>>,
}

/// Best-effort fan-out to users and rooms. Nothing is queued for offline users.
pub(crate) struct EventRelay {
    presence: Arc<PresenceRegistry>,
    rooms: RwLock<Rooms>,
}

impl EventRelay {
    pub(crate) fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self {
            presence,
            rooms: RwLock::new(Rooms::default()),
        }
    }

    pub(crate) async fn join_room(&self, connection_id: ConnectionId, room: RoomId) {
        let mut rooms = self.rooms.write().await;
        rooms.members.entry(room).or_default().insert(connection_id);
        rooms.joined.entry(connection_id).or_default().insert(room);
        debug!(%connection_id, %room, "relay: joined room");
    }

    pub(crate) async fn leave_room(&self, connection_id: ConnectionId, room: RoomId) {
        let mut rooms = self.rooms.write().await;
        remove_member(&mut rooms, connection_id, room);
        if let Some(joined) = rooms.joined.get_mut(&connection_id) {
            joined.remove(&room);
            if joined.is_empty() {
                rooms.joined.remove(&connection_id);
            }
        }
    }

    /// Removes every room membership of a closed connection.
    pub(crate) async fn drop_connection(&self, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        let Some(joined) = rooms.joined.remove(&connection_id) else {
            return;
        };
        for room in joined {
            remove_member(&mut rooms, connection_id, room);
        }
    }

    pub(crate) async fn close_room(&self, room: RoomId) {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.members.remove(&room) else {
            return;
        };
        for connection_id in members {
            if let Some(joined) = rooms.joined.get_mut(&connection_id) {
                joined.remove(&room);
                if joined.is_empty() {
                    rooms.joined.remove(&connection_id);
                }
            }
        }
        debug!(%room, "relay: room closed");
    }

    pub(crate) async fn calls_joined_by(&self, connection_id: ConnectionId) -> Vec<CallId> {
        self.rooms
            .read()
            .await
            .joined
            .get(&connection_id)
            .map(|rooms| {
                rooms
                    .iter()
                    .filter_map(|room| match room {
                        RoomId::Call(call_id) => Some(*call_id),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) async fn room_members(&self, room: RoomId) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .await
            .members
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn emit_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        self.emit_to_user_except(user_id, event, None).await
    }

    pub(crate) async fn emit_to_user_except(
        &self,
        user_id: UserId,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let targets: Vec<_> = self
            .presence
            .connections_for(user_id)
            .await
            .into_iter()
            .filter(|connection_id| Some(*connection_id) != exclude)
            .collect();
        if targets.is_empty() {
            debug!(user_id = user_id.0, "relay: user offline, event dropped");
        }
        self.deliver(targets, event).await
    }

    pub(crate) async fn emit_to_room(
        &self,
        room: RoomId,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let targets: Vec<_> = self
            .room_members(room)
            .await
            .into_iter()
            .filter(|connection_id| Some(*connection_id) != exclude)
            .collect();
        self.deliver(targets, event).await
    }

    pub(crate) async fn emit_to_connection(
        &self,
        connection_id: ConnectionId,
        event: &ServerEvent,
    ) -> bool {
        self.deliver(vec![connection_id], event).await == 1
    }

    async fn deliver(&self, targets: Vec<ConnectionId>, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for connection_id in targets {
            let Some(sender) = self.presence.sender(connection_id).await else {
                continue;
            };
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

fn remove_member(rooms: &mut Rooms, connection_id: ConnectionId, room: RoomId) {
    if let Some(members) = rooms.members.get_mut(&room) {
        members.remove(&connection_id);
        if members.is_empty() {
            rooms.members.remove(&room);
        }
    }
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
