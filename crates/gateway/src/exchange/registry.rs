//! Process-wide index of live rooms.

use dashmap::DashMap;

use super::room::Room;

/// Index of rooms by session identifier.
///
/// Observers arriving through other channels (share links, monitoring)
/// look rooms up here.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
}

impl RoomRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a room under its identifier, replacing any previous entry.
    pub fn register(&self, room: Room) {
        let id = room.id().to_string();
        if let Some(previous) = self.rooms.insert(id.clone(), room) {
            tracing::warn!(room_id = %id, done = previous.is_done(), "Replaced registered room");
        }
    }

    /// Removes a room. An entry that has since been replaced by another
    /// room instance with the same identifier is left alone.
    pub fn unregister(&self, room: &Room) {
        let removed = self
            .rooms
            .remove_if(room.id(), |_, existing| existing.same_room(room));
        if removed.is_some() {
            tracing::debug!(room_id = %room.id(), "Room unregistered");
        }
    }

    /// Looks up a room by session identifier.
    pub fn get(&self, id: &str) -> Option<Room> {
        self.rooms.get(id).map(|entry| entry.value().clone())
    }

    /// Returns the number of registered rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Returns true if no rooms are registered.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
