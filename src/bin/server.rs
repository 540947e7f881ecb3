use std::net::SocketAddr;
use std::sync::OnceLock;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use warp::{self, Filter};

use rusty_hub::config::ServerConfig;
use rusty_hub::core::Hub;
use rusty_hub::handlers::context::with_hub;
use rusty_hub::handlers::ws_route;

// Process-wide default hub, set once at startup
static DEFAULT_HUB: OnceLock<Hub> = OnceLock::new();

fn default_hub() -> Option<Hub> {
    DEFAULT_HUB.get().cloned()
}

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Initialize logging
    env_logger::init();

    // Load config from .env
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, path={}",
        config.host, config.port, config.ws_path
    );
    info!("Hub settings: {:?}", config.hub);

    // Create the hub and start its dispatcher
    let cancel = CancellationToken::new();
    let (hub, dispatcher) = Hub::spawn(config.hub.clone(), cancel.clone());
    if DEFAULT_HUB.set(hub).is_err() {
        error!("Default hub was already initialized");
        std::process::exit(1);
    }
    let Some(hub) = default_hub() else {
        error!("Default hub is not available");
        std::process::exit(1);
    };

    // Create WebSocket route
    let ws = ws_route(hub.clone(), &config.ws_path);

    // Create health check route
    let health_route = warp::path("health").and(warp::path::end()).map(|| "OK");

    // Hub counters as JSON
    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(with_hub(hub.clone()))
        .map(|hub: Hub| warp::reply::json(&hub.stats()));

    // Combine routes
    let routes = ws.or(health_route).or(stats_route);

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            cancel.cancel();
        }
    };

    let (bound, server) = match warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown) {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    // Start the server
    info!("Starting Rusty Hub server on {}", bound);
    server.await;

    if let Err(e) = dispatcher.await {
        error!("Hub dispatcher task failed: {}", e);
    }
    info!("Server stopped");
}
