//! 积分 API 处理器

use axum::{
    Json,
    extract::{Path, Query, State},
};
use loyalty_shared::http::{ApiResponse, PageResponse, PaginationParams};

use crate::{
    error::PointError,
    models::{PointBalance, PointHistory, PointResetHistory},
    state::AppState,
};

/// 余额与等级（内部接口，需要 API Key）
///
/// GET /users/customer/{id}/points
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<PointBalance>>, PointError> {
    let balance = state.points.get_balance(&user_id).await?;
    Ok(Json(ApiResponse::success(balance)))
}

/// GET /users/{id}/points/history?page=1&pageSize=20
pub async fn list_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(pagination): Query<PaginationParams>,
) -> Result<Json<ApiResponse<PageResponse<PointHistory>>>, PointError> {
    let page = state.points.history(&user_id, &pagination).await?;
    Ok(Json(ApiResponse::success(page)))
}

/// GET /users/{id}/points/resets
pub async fn list_resets(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<PointResetHistory>>>, PointError> {
    let resets = state.points.resets(&user_id).await?;
    Ok(Json(ApiResponse::success(resets)))
}
