//! 库存管理 API 处理器

use axum::{
    Json,
    extract::{Path, Query, State},
};
use loyalty_shared::http::{ApiResponse, PageResponse, PaginationParams};
use validator::Validate;

use crate::{
    error::InventoryError,
    models::{Item, LowStockAlert, NewItem, StockAdjustmentRequest, StockTransaction},
    state::AppState,
};

/// 新建商品
///
/// POST /items
pub async fn create_item(
    State(state): State<AppState>,
    Json(req): Json<NewItem>,
) -> Result<Json<ApiResponse<Item>>, InventoryError> {
    req.validate()?;
    let item = state.ledger.create_item(req).await?;
    Ok(Json(ApiResponse::success(item)))
}

/// GET /items/{id}
pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Item>>, InventoryError> {
    let item = state.ledger.get_item(id).await?;
    Ok(Json(ApiResponse::success(item)))
}

/// 入库
///
/// POST /items/{id}/stock/increase
pub async fn increase_stock(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<StockAdjustmentRequest>,
) -> Result<Json<ApiResponse<StockTransaction>>, InventoryError> {
    req.validate()?;
    let tx = state.ledger.increase_stock(id, req).await?;
    Ok(Json(ApiResponse::success_with_message(tx, "入库成功")))
}

/// 出库，库存不足返回 400
///
/// POST /items/{id}/stock/decrease
pub async fn decrease_stock(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<StockAdjustmentRequest>,
) -> Result<Json<ApiResponse<StockTransaction>>, InventoryError> {
    req.validate()?;
    let tx = state.ledger.decrease_stock(id, req).await?;
    Ok(Json(ApiResponse::success_with_message(tx, "出库成功")))
}

/// GET /items/low-stock
pub async fn low_stock_report(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<LowStockAlert>>>, InventoryError> {
    let alerts = state.ledger.low_stock_report().await?;
    Ok(Json(ApiResponse::success(alerts)))
}

/// GET /items/{id}/transactions?page=1&pageSize=20
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(pagination): Query<PaginationParams>,
) -> Result<Json<ApiResponse<PageResponse<StockTransaction>>>, InventoryError> {
    let page = state.ledger.list_transactions(id, &pagination).await?;
    Ok(Json(ApiResponse::success(page)))
}
