//! Request-scoped context helpers
//!
//! Application handlers composed around the upgrade entrypoint can carry the
//! hub and the active connection in an `http::Extensions` map.

use std::convert::Infallible;
use std::sync::Arc;

use warp::http::Extensions;
use warp::Filter;

use crate::core::connection::Connection;
use crate::core::hub::Hub;

#[derive(Clone)]
struct HubHandle(Hub);

#[derive(Clone)]
struct ActiveConnection(Arc<Connection>);

/// Helper filter to include the hub in a route
pub fn with_hub(hub: Hub) -> impl Filter<Extract = (Hub,), Error = Infallible> + Clone {
    warp::any().map(move || hub.clone())
}

pub fn attach_hub(extensions: &mut Extensions, hub: Hub) {
    extensions.insert(HubHandle(hub));
}

pub fn hub_from(extensions: &Extensions) -> Option<Hub> {
    extensions.get::<HubHandle>().map(|handle| handle.0.clone())
}

pub fn attach_connection(extensions: &mut Extensions, conn: Arc<Connection>) {
    extensions.insert(ActiveConnection(conn));
}

pub fn connection_from(extensions: &Extensions) -> Option<Arc<Connection>> {
    extensions.get::<ActiveConnection>().map(|active| active.0.clone())
}
