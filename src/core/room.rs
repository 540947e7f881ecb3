//! Room registry
//! Named groups of connections, created on first join and removed when emptied

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::core::connection::Connection;
use crate::error::{HubError, Result};

/// Represents a room and its current members
#[derive(Debug, Clone)]
pub struct Room {
    pub name: String,
    /// Members keyed by connection ID
    members: HashMap<String, Arc<Connection>>,
}

impl Room {
    fn new(name: String) -> Self {
        Self {
            name,
            members: HashMap::new(),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_member(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }
}

/// Outcome of a membership change, so callers know whether to fire hooks and log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// The connection was added or removed
    Changed,
    /// The connection was already in (or already absent from) the room
    Unchanged,
    /// A leave emptied the room and the room entry was removed
    RoomRemoved,
}

/// Maps room names to members.
///
/// Lock order is always registry, then the connection's own room set. Both are
/// updated under the registry write lock so a caller never observes one
/// without the other.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed
    pub fn join(&self, conn: &Arc<Connection>, room_name: &str) -> Result<Membership> {
        if room_name.is_empty() {
            return Err(HubError::InvalidRoomName);
        }

        let mut rooms = self.rooms.write()?;
        // Checked under the registry lock: unregistration closes first, then cleans up here
        if conn.is_closed() {
            return Err(HubError::ConnectionClosed);
        }

        let room = rooms
            .entry(room_name.to_string())
            .or_insert_with(|| Room::new(room_name.to_string()));
        let inserted = room
            .members
            .insert(conn.id().to_string(), conn.clone())
            .is_none();
        conn.rooms.write()?.insert(room_name.to_string());

        if inserted {
            debug!("Connection {} joined room {}", conn.id(), room_name);
            Ok(Membership::Changed)
        } else {
            Ok(Membership::Unchanged)
        }
    }

    /// Remove a connection from a room; removing a non-member is a no-op
    pub fn leave(&self, conn: &Arc<Connection>, room_name: &str) -> Result<Membership> {
        let mut rooms = self.rooms.write()?;
        Self::leave_locked(&mut rooms, conn, room_name)
    }

    /// Remove a connection from every room it belongs to.
    ///
    /// Returns the rooms it actually left.
    pub fn leave_all(&self, conn: &Arc<Connection>) -> Result<Vec<String>> {
        let mut rooms = self.rooms.write()?;
        let names: Vec<String> = conn.rooms.read()?.iter().cloned().collect();

        let mut left = Vec::with_capacity(names.len());
        for name in names {
            if Self::leave_locked(&mut rooms, conn, &name)? != Membership::Unchanged {
                left.push(name);
            }
        }
        Ok(left)
    }

    fn leave_locked(
        rooms: &mut HashMap<String, Room>,
        conn: &Arc<Connection>,
        room_name: &str,
    ) -> Result<Membership> {
        conn.rooms.write()?.remove(room_name);

        let Some(room) = rooms.get_mut(room_name) else {
            return Ok(Membership::Unchanged);
        };
        if room.members.remove(conn.id()).is_none() {
            return Ok(Membership::Unchanged);
        }
        debug!("Connection {} left room {}", conn.id(), room_name);

        if room.members.is_empty() {
            rooms.remove(room_name);
            debug!("Room {} is empty and was removed", room_name);
            return Ok(Membership::RoomRemoved);
        }
        Ok(Membership::Changed)
    }

    /// Members of a room, minus an optional excluded connection
    pub fn members_except(&self, room_name: &str, exclude: Option<&str>) -> Result<Vec<Arc<Connection>>> {
        let rooms = self.rooms.read()?;
        Ok(rooms
            .get(room_name)
            .map(|room| {
                room.members
                    .iter()
                    .filter(|(id, _)| Some(id.as_str()) != exclude)
                    .map(|(_, conn)| conn.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Drop every room and clear the members' room sets
    pub fn clear(&self) -> Result<()> {
        let mut rooms = self.rooms.write()?;
        for room in rooms.values() {
            for conn in room.members.values() {
                conn.rooms.write()?.remove(&room.name);
            }
        }
        rooms.clear();
        Ok(())
    }

    pub fn contains(&self, room_name: &str) -> bool {
        self.rooms
            .read()
            .map(|rooms| rooms.contains_key(room_name))
            .unwrap_or(false)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().map(|rooms| rooms.len()).unwrap_or(0)
    }

    /// Number of members in a room, zero if the room does not exist
    pub fn client_count(&self, room_name: &str) -> usize {
        self.rooms
            .read()
            .ok()
            .and_then(|rooms| rooms.get(room_name).map(Room::member_count))
            .unwrap_or(0)
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms
            .read()
            .map(|rooms| rooms.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Connection IDs in a room
    pub fn member_ids(&self, room_name: &str) -> Vec<String> {
        self.rooms
            .read()
            .ok()
            .and_then(|rooms| rooms.get(room_name).map(|room| room.members.keys().cloned().collect()))
            .unwrap_or_default()
    }
}
