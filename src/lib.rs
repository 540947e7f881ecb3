//! Rusty Hub - a real-time WebSocket connection hub
//!
//! This library accepts already-authenticated WebSocket connections, groups
//! them into named rooms and relays messages between them with bounded
//! buffering: producers never block, slow consumers get disconnected.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;

// Re-export main components
pub use config::{HubConfig, Hooks, ServerConfig};
pub use crate::core::{Connection, Dispatcher, Envelope, Hub, HubState, HubStats};
pub use error::{HubError, Result};
