//! Core functionality: connections, rooms and the hub dispatcher

pub mod connection;
pub mod hub;
pub mod message;
pub mod room;

// Re-export main components for convenience
pub use connection::{Connection, Payload};
pub use hub::{Dispatcher, Hub, HubState, HubStats};
pub use message::{ControlKind, Envelope};
pub use room::{Membership, Room, RoomRegistry};
