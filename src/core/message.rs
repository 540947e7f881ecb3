//! Typed message envelope exchanged over the wire

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::constants::{MSG_BROADCAST, MSG_JOIN_ROOM, MSG_LEAVE_ROOM, MSG_ROOM_BROADCAST};
use crate::error::{HubError, Result};

/// Message envelope carried by every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type discriminator
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque application payload
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Sender identity, always overwritten server-side on inbound frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Control types the hub interprets itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    JoinRoom,
    LeaveRoom,
    RoomBroadcast,
    Broadcast,
}

impl ControlKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            MSG_JOIN_ROOM => Some(Self::JoinRoom),
            MSG_LEAVE_ROOM => Some(Self::LeaveRoom),
            MSG_ROOM_BROADCAST => Some(Self::RoomBroadcast),
            MSG_BROADCAST => Some(Self::Broadcast),
            _ => None,
        }
    }
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            room: None,
            user_id: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Decode an inbound frame
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| HubError::MessageParseError(e.to_string()))
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Overwrite the sender identity and timestamp with server-side values
    pub fn stamp(&mut self, user_id: &str) {
        self.user_id = Some(user_id.to_string());
        self.timestamp = Utc::now();
    }

    pub fn control(&self) -> Option<ControlKind> {
        ControlKind::parse(&self.kind)
    }

    /// Room name if present and non-empty
    pub fn room_name(&self) -> Option<&str> {
        self.room.as_deref().filter(|r| !r.is_empty())
    }
}

// Clients may send anything in `timestamp`; it is replaced on receipt anyway
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now))
}
