//! Request handlers and route glue for the hub

pub mod context;
pub mod routes;
pub mod websocket;

// Re-export the entrypoints
pub use routes::{ws_route, ws_route_with_identity};
pub use websocket::{handle_upgrade, serve_client};
