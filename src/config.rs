//! Hub and server configuration
//! Tunable timing and buffer parameters plus optional lifecycle hooks

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BROADCAST_BUFFER, DEFAULT_HOST, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PONG_WAIT_SECS,
    DEFAULT_PORT, DEFAULT_ROOM_BROADCAST_BUFFER, DEFAULT_SEND_BUFFER, DEFAULT_WRITE_WAIT_SECS,
    MAX_WAIT_SECS, MIN_PING_PERIOD_MS, WS_PATH,
};
use crate::core::connection::Connection;
use crate::core::message::Envelope;
use crate::error::{HubError, Result};

/// Invoked on connect and disconnect
pub type ConnectionHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Invoked for every decoded inbound envelope
pub type MessageHook = Arc<dyn Fn(&Arc<Connection>, &Envelope) + Send + Sync>;
/// Invoked on room join and leave with the room name
pub type RoomHook = Arc<dyn Fn(&Arc<Connection>, &str) + Send + Sync>;

/// Optional lifecycle callbacks.
///
/// Hooks run inline: `on_connect`, `on_disconnect` and cleanup leaves run on the
/// dispatcher task, `on_message` on the connection's read pump, and explicit
/// joins/leaves on whichever task called [`crate::Hub::join_room`] or
/// [`crate::Hub::leave_room`]. Keep them cheap or hand work off.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_connect: Option<ConnectionHook>,
    pub on_disconnect: Option<ConnectionHook>,
    pub on_message: Option<MessageHook>,
    pub on_join_room: Option<RoomHook>,
    pub on_leave_room: Option<RoomHook>,
}

impl Hooks {
    pub(crate) fn connected(&self, conn: &Arc<Connection>) {
        if let Some(hook) = &self.on_connect {
            hook(conn);
        }
    }

    pub(crate) fn disconnected(&self, conn: &Arc<Connection>) {
        if let Some(hook) = &self.on_disconnect {
            hook(conn);
        }
    }

    pub(crate) fn message(&self, conn: &Arc<Connection>, envelope: &Envelope) {
        if let Some(hook) = &self.on_message {
            hook(conn, envelope);
        }
    }

    pub(crate) fn joined(&self, conn: &Arc<Connection>, room: &str) {
        if let Some(hook) = &self.on_join_room {
            hook(conn, room);
        }
    }

    pub(crate) fn left(&self, conn: &Arc<Connection>, room: &str) {
        if let Some(hook) = &self.on_leave_room {
            hook(conn, room);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_join_room", &self.on_join_room.is_some())
            .field("on_leave_room", &self.on_leave_room.is_some())
            .finish()
    }
}

/// Hub configuration.
///
/// Start from [`HubConfig::default`] and override what you need with the
/// `with_*` methods; later calls win.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Deadline for a single frame write (payload, ping or close)
    pub write_wait: Duration,
    /// How long the read side waits for any frame, pongs included
    pub pong_wait: Duration,
    /// Largest inbound frame accepted before the connection is failed
    pub max_message_size: usize,
    /// Capacity of the hub's global broadcast request queue
    pub broadcast_buffer: usize,
    /// Capacity of the hub's room broadcast request queue
    pub room_broadcast_buffer: usize,
    /// Capacity of each connection's outbound queue
    pub send_buffer: usize,
    /// Merge payloads queued during a write into the next frame, newline separated
    pub coalesce_writes: bool,
    pub hooks: Hooks,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(DEFAULT_WRITE_WAIT_SECS),
            pong_wait: Duration::from_secs(DEFAULT_PONG_WAIT_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            broadcast_buffer: DEFAULT_BROADCAST_BUFFER,
            room_broadcast_buffer: DEFAULT_ROOM_BROADCAST_BUFFER,
            send_buffer: DEFAULT_SEND_BUFFER,
            coalesce_writes: true,
            hooks: Hooks::default(),
        }
    }
}

impl HubConfig {
    /// Keepalive interval, 9/10 of `pong_wait`.
    ///
    /// Clamped to the accepted range; [`HubConfig::validate`] reports values
    /// outside it.
    pub fn ping_period(&self) -> Duration {
        let period = match self.pong_wait.checked_mul(9) {
            Some(scaled) => scaled / 10,
            None => self.pong_wait / 10 * 9,
        };
        period.clamp(min_ping_period(), max_wait())
    }

    /// `pong_wait` limited to the accepted range, used for the read deadline
    pub fn read_timeout(&self) -> Duration {
        self.pong_wait.min(max_wait())
    }

    pub fn with_write_wait(mut self, write_wait: Duration) -> Self {
        self.write_wait = write_wait;
        self
    }

    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_broadcast_buffer(mut self, capacity: usize) -> Self {
        self.broadcast_buffer = capacity;
        self
    }

    pub fn with_room_broadcast_buffer(mut self, capacity: usize) -> Self {
        self.room_broadcast_buffer = capacity;
        self
    }

    pub fn with_send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity;
        self
    }

    pub fn with_coalesce_writes(mut self, enabled: bool) -> Self {
        self.coalesce_writes = enabled;
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.hooks.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.hooks.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn on_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>, &Envelope) + Send + Sync + 'static,
    {
        self.hooks.on_message = Some(Arc::new(hook));
        self
    }

    pub fn on_join_room<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>, &str) + Send + Sync + 'static,
    {
        self.hooks.on_join_room = Some(Arc::new(hook));
        self
    }

    pub fn on_leave_room<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>, &str) + Send + Sync + 'static,
    {
        self.hooks.on_leave_room = Some(Arc::new(hook));
        self
    }

    /// Reject values the hub cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.write_wait.is_zero() {
            return Err(HubError::ConfigError("write wait must be greater than zero".to_string()));
        }
        for (name, wait) in [("write wait", self.write_wait), ("pong wait", self.pong_wait)] {
            if wait > max_wait() {
                return Err(HubError::ConfigError(format!(
                    "{} must not exceed {} seconds",
                    name, MAX_WAIT_SECS
                )));
            }
        }
        let scaled = self.pong_wait.checked_mul(9).ok_or_else(|| {
            HubError::ConfigError("pong wait is too large to derive a ping period".to_string())
        })?;
        if scaled / 10 < min_ping_period() {
            return Err(HubError::ConfigError(
                "pong wait is too short to derive a ping period".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(HubError::ConfigError(
                "max message size must be greater than zero".to_string(),
            ));
        }
        for (name, capacity) in [
            ("broadcast buffer", self.broadcast_buffer),
            ("room broadcast buffer", self.room_broadcast_buffer),
            ("send buffer", self.send_buffer),
        ] {
            if capacity == 0 {
                return Err(HubError::ConfigError(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }
}

fn min_ping_period() -> Duration {
    Duration::from_millis(MIN_PING_PERIOD_MS)
}

fn max_wait() -> Duration {
    Duration::from_secs(MAX_WAIT_SECS)
}

/// Server configuration parameters for the standalone binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path the websocket upgrade is mounted at
    pub ws_path: String,
    pub hub: HubConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let host = env::var("RUSTY_HUB_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = env_or("RUSTY_HUB_PORT", DEFAULT_PORT)?;
        let ws_path = env::var("RUSTY_HUB_WS_PATH").unwrap_or(WS_PATH.to_string());

        let write_wait = env_or("RUSTY_HUB_WRITE_WAIT_SECS", DEFAULT_WRITE_WAIT_SECS)?;
        let pong_wait = env_or("RUSTY_HUB_PONG_WAIT_SECS", DEFAULT_PONG_WAIT_SECS)?;
        let max_message_size = env_or("RUSTY_HUB_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?;
        let broadcast_buffer = env_or("RUSTY_HUB_BROADCAST_BUFFER", DEFAULT_BROADCAST_BUFFER)?;
        let room_broadcast_buffer =
            env_or("RUSTY_HUB_ROOM_BROADCAST_BUFFER", DEFAULT_ROOM_BROADCAST_BUFFER)?;
        let send_buffer = env_or("RUSTY_HUB_SEND_BUFFER", DEFAULT_SEND_BUFFER)?;
        let coalesce_writes = env::var("RUSTY_HUB_COALESCE_WRITES")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(true);

        let hub = HubConfig::default()
            .with_write_wait(Duration::from_secs(write_wait))
            .with_pong_wait(Duration::from_secs(pong_wait))
            .with_max_message_size(max_message_size)
            .with_broadcast_buffer(broadcast_buffer)
            .with_room_broadcast_buffer(room_broadcast_buffer)
            .with_send_buffer(send_buffer)
            .with_coalesce_writes(coalesce_writes);
        hub.validate()?;

        Ok(Self {
            host,
            port,
            ws_path,
            hub,
        })
    }
}

/// Read and parse an environment variable, falling back to `default` when unset
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => parse_setting(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_setting<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| HubError::ConfigError(format!("{} has an invalid value: {:?}", key, raw)))
}
