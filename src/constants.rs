// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";

// Header carrying the identity resolved by an upstream authentication layer
pub const USER_ID_HEADER: &str = "x-user-id";

// Connection timing defaults
pub const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
pub const DEFAULT_PONG_WAIT_SECS: u64 = 60;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

// Bounds for the write and pong deadlines
pub const MIN_PING_PERIOD_MS: u64 = 1;
pub const MAX_WAIT_SECS: u64 = 24 * 60 * 60;

// Queue capacity defaults
pub const DEFAULT_BROADCAST_BUFFER: usize = 256;
pub const DEFAULT_ROOM_BROADCAST_BUFFER: usize = 256;
pub const DEFAULT_SEND_BUFFER: usize = 256;

// Control message tags interpreted by the hub
pub const MSG_JOIN_ROOM: &str = "join_room";
pub const MSG_LEAVE_ROOM: &str = "leave_room";
pub const MSG_ROOM_BROADCAST: &str = "room_broadcast";
pub const MSG_BROADCAST: &str = "broadcast";
