//! services/api/src/web/rooms.rs
//!
//! Tracks which live connections belong to which broadcast channels: one
//! personal room per authenticated user, one room per joined conversation.

use crate::web::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// A broadcast channel key: the user's personal room or a conversation room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    User(Uuid),
    Chat(Uuid),
}

/// Maps rooms to the outbound senders of their member connections.
///
/// Membership changes and broadcasts come from different tasks, so the map
/// sits behind a mutex; every critical section is a plain map operation.
#[derive(Default)]
pub struct RoomManager {
    rooms: Mutex<HashMap<RoomId, HashMap<Uuid, UnboundedSender<ServerMessage>>>>,
}

impl RoomManager {
    /// Adds a connection to a room. Joining a room twice just replaces the
    /// stored sender.
    pub fn join(&self, room: RoomId, conn_id: Uuid, sender: UnboundedSender<ServerMessage>) {
        self.rooms
            .lock()
            .unwrap()
            .entry(room)
            .or_default()
            .insert(conn_id, sender);
    }

    /// Removes a connection from a room. Leaving a room it never joined is a
    /// no-op.
    pub fn leave(&self, room: RoomId, conn_id: Uuid) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
    }

    /// Removes a connection from every room it joined; called on disconnect.
    pub fn leave_all(&self, conn_id: Uuid) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    /// Sends a message to every member of a room. An unknown or empty room is
    /// a no-op; members whose connection has gone away are pruned.
    pub fn broadcast(&self, room: RoomId, message: ServerMessage) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(members) = rooms.get_mut(&room) {
            members.retain(|_, sender| sender.send(message.clone()).is_ok());
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
    }

    /// Current member count of a room.
    pub fn member_count(&self, room: RoomId) -> usize {
        self.rooms
            .lock()
            .unwrap()
            .get(&room)
            .map(|members| members.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn chunk(text: &str) -> ServerMessage {
        ServerMessage::ResponseChunk {
            chat_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            chunk: text.to_string(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member() {
        let rooms = RoomManager::default();
        let room = RoomId::Chat(Uuid::new_v4());

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        rooms.join(room, Uuid::new_v4(), tx_a);
        rooms.join(room, Uuid::new_v4(), tx_b);

        rooms.broadcast(room, chunk("hello"));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn leaving_stops_delivery() {
        let rooms = RoomManager::default();
        let room = RoomId::Chat(Uuid::new_v4());
        let conn = Uuid::new_v4();

        let (tx, mut rx) = mpsc::unbounded_channel();
        rooms.join(room, conn, tx);
        rooms.leave(room, conn);

        rooms.broadcast(room, chunk("gone"));
        assert!(rx.try_recv().is_err());
        assert_eq!(rooms.member_count(room), 0);
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room() {
        let rooms = RoomManager::default();
        let conn = Uuid::new_v4();
        let user_room = RoomId::User(Uuid::new_v4());
        let chat_room = RoomId::Chat(Uuid::new_v4());

        let (tx, _rx) = mpsc::unbounded_channel();
        rooms.join(user_room, conn, tx.clone());
        rooms.join(chat_room, conn, tx);

        rooms.leave_all(conn);
        assert_eq!(rooms.member_count(user_room), 0);
        assert_eq!(rooms.member_count(chat_room), 0);
    }

    #[tokio::test]
    async fn closed_receivers_are_pruned_on_broadcast() {
        let rooms = RoomManager::default();
        let room = RoomId::Chat(Uuid::new_v4());

        let (tx, rx) = mpsc::unbounded_channel();
        rooms.join(room, Uuid::new_v4(), tx);
        drop(rx);

        rooms.broadcast(room, chunk("nobody home"));
        assert_eq!(rooms.member_count(room), 0);
    }

    #[tokio::test]
    async fn broadcast_to_an_unknown_room_is_a_noop() {
        let rooms = RoomManager::default();
        rooms.broadcast(RoomId::Chat(Uuid::new_v4()), chunk("into the void"));
    }
}
