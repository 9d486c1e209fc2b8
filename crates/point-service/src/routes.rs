//! 路由配置

use axum::{Router, middleware, routing::get};
use loyalty_shared::internal_auth::{InternalApiKeys, require_internal_api_key};

use crate::{handlers, state::AppState};

pub fn api_routes(api_keys: InternalApiKeys) -> Router<AppState> {
    let internal = Router::new()
        .route("/users/customer/{id}/points", get(handlers::get_balance))
        .layer(middleware::from_fn_with_state(
            api_keys,
            require_internal_api_key,
        ));

    Router::new()
        .route("/users/{id}/points/history", get(handlers::list_history))
        .route("/users/{id}/points/resets", get(handlers::list_resets))
        .merge(internal)
}
