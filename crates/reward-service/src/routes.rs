//! 路由配置

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::{handlers, state::AppState};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/claims",
            post(handlers::claim_reward).get(handlers::list_claims),
        )
        .route(
            "/claims/status/{status}",
            get(handlers::list_claims_by_status),
        )
        .route("/claims/{id}", get(handlers::get_claim))
        .route("/claims/{id}/status", put(handlers::update_claim_status))
        .route("/users/{user_id}/claims", get(handlers::list_user_claims))
        .route("/rewards", post(handlers::create_reward))
        .route("/rewards/{id}", get(handlers::get_reward))
}
