//! 路由配置

use axum::{
    Router,
    routing::{get, post},
};

use crate::{handlers, state::AppState};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/items", post(handlers::create_item))
        .route("/items/low-stock", get(handlers::low_stock_report))
        .route("/items/{id}", get(handlers::get_item))
        .route(
            "/items/{id}/stock/increase",
            post(handlers::increase_stock),
        )
        .route(
            "/items/{id}/stock/decrease",
            post(handlers::decrease_stock),
        )
        .route(
            "/items/{id}/transactions",
            get(handlers::list_transactions),
        )
}
