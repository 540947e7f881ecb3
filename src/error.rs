use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum HubError {
    // Connection errors
    ConnectionClosed,
    SendBufferFull,
    TransportError(String),

    // Message errors
    MessageParseError(String),
    MessageTooLarge(usize),
    EncodeError(String),

    // Room errors
    InvalidRoomName,

    // Hub errors
    HubStopped,
    LockPoisoned(String),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendBufferFull => write!(f, "Connection send buffer is full"),
            Self::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::EncodeError(msg) => write!(f, "Message encode error: {}", msg),
            Self::InvalidRoomName => write!(f, "Room name must not be empty"),
            Self::HubStopped => write!(f, "Hub is not running"),
            Self::LockPoisoned(msg) => write!(f, "Lock poisoned: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for HubError {}

// Converting from PoisonError to facilitate poisoned lock handling
impl<T> From<PoisonError<T>> for HubError {
    fn from(err: PoisonError<T>) -> Self {
        HubError::LockPoisoned(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::EncodeError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
