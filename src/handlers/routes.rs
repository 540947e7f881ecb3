//! Route registration for the upgrade entrypoint

use warp::filters::BoxedFilter;
use warp::{Filter, Rejection, Reply};

use crate::constants::{USER_ID_HEADER, WS_PATH};
use crate::core::hub::Hub;
use crate::handlers::context::with_hub;
use crate::handlers::websocket::handle_upgrade;

/// Mount the websocket upgrade as `GET /<path>`.
///
/// The user identity is read from the optional `x-user-id` header, which an
/// upstream authentication layer is trusted to have set.
pub fn ws_route(hub: Hub, path: &str) -> BoxedFilter<(Box<dyn Reply>,)> {
    ws_route_with_identity(hub, path, warp::header::optional::<String>(USER_ID_HEADER))
}

/// Mount the websocket upgrade with a caller-supplied identity filter.
///
/// The filter runs before the upgrade; rejecting there refuses the connection.
pub fn ws_route_with_identity<F>(hub: Hub, path: &str, identity: F) -> BoxedFilter<(Box<dyn Reply>,)>
where
    F: Filter<Extract = (Option<String>,), Error = Rejection> + Clone + Send + Sync + 'static,
{
    mount(path)
        .and(warp::get())
        .and(warp::ws())
        .and(identity)
        .and(with_hub(hub))
        .map(handle_upgrade)
        .boxed()
}

/// Exact-match filter for a slash separated path, `ws` when empty
pub fn mount(path: &str) -> BoxedFilter<()> {
    let trimmed = path.trim_matches('/');
    let path = if trimmed.is_empty() { WS_PATH } else { trimmed };

    path.split('/')
        .filter(|segment| !segment.is_empty())
        .fold(warp::any().boxed(), |filter, segment| {
            filter.and(warp::path(segment.to_string())).boxed()
        })
        .and(warp::path::end())
        .boxed()
}
