//! 奖励领取 API 处理器

use axum::{
    Json,
    extract::{Path, Query, State},
};
use loyalty_shared::http::{ApiResponse, PageResponse, PaginationParams};

use crate::{
    error::ClaimError,
    models::{ClaimRewardRequest, ClaimStatus, NewReward, Reward, RewardClaim, UpdateClaimStatusRequest},
    state::AppState,
};

/// 领取奖励
///
/// POST /claims
pub async fn claim_reward(
    State(state): State<AppState>,
    Json(req): Json<ClaimRewardRequest>,
) -> Result<Json<ApiResponse<RewardClaim>>, ClaimError> {
    let claim = state.claims.claim_reward(req).await?;
    Ok(Json(ApiResponse::success_with_message(claim, "领取成功，等待审核")))
}

/// 变更领取状态（管理员）
///
/// PUT /claims/{id}/status
pub async fn update_claim_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateClaimStatusRequest>,
) -> Result<Json<ApiResponse<RewardClaim>>, ClaimError> {
    let claim = state.claims.update_claim_status(id, req).await?;
    Ok(Json(ApiResponse::success(claim)))
}

/// GET /claims/{id}
pub async fn get_claim(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<RewardClaim>>, ClaimError> {
    let claim = state.claims.get_claim(id).await?;
    Ok(Json(ApiResponse::success(claim)))
}

/// GET /claims?page=1&pageSize=20
pub async fn list_claims(
    State(state): State<AppState>,
    Query(pagination): Query<PaginationParams>,
) -> Result<Json<ApiResponse<PageResponse<RewardClaim>>>, ClaimError> {
    let page = state.claims.list_claims(&pagination).await?;
    Ok(Json(ApiResponse::success(page)))
}

/// GET /claims/status/{status}
pub async fn list_claims_by_status(
    State(state): State<AppState>,
    Path(status): Path<String>,
    Query(pagination): Query<PaginationParams>,
) -> Result<Json<ApiResponse<PageResponse<RewardClaim>>>, ClaimError> {
    let status: ClaimStatus = status.parse().map_err(ClaimError::Validation)?;
    let page = state
        .claims
        .list_claims_by_status(status, &pagination)
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// GET /users/{user_id}/claims
pub async fn list_user_claims(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<RewardClaim>>>, ClaimError> {
    let claims = state.claims.list_user_claims(&user_id).await?;
    Ok(Json(ApiResponse::success(claims)))
}

/// GET /rewards/{id}
pub async fn get_reward(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Reward>>, ClaimError> {
    let reward = state.claims.get_reward(id).await?;
    Ok(Json(ApiResponse::success(reward)))
}

/// 新建奖励（管理员）
///
/// POST /rewards
pub async fn create_reward(
    State(state): State<AppState>,
    Json(req): Json<NewReward>,
) -> Result<Json<ApiResponse<Reward>>, ClaimError> {
    let reward = state.claims.create_reward(req).await?;
    Ok(Json(ApiResponse::success(reward)))
}
