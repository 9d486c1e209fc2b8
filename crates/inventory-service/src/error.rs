//! 库存服务错误类型

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use loyalty_shared::error::LoyaltyError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    // ==================== 资源错误 ====================
    #[error("商品不存在: {0}")]
    ItemNotFound(i64),

    // ==================== 业务规则错误 ====================
    #[error("库存不足: 商品 {item_id} 当前库存 {available}，请求扣减 {requested}")]
    InsufficientStock {
        item_id: i64,
        available: i32,
        requested: i32,
    },

    #[error("SKU 已存在: {0}")]
    DuplicateSku(String),

    /// 同一领取记录的库存变动已登记过
    #[error("库存变动已登记: 商品 {item_id}, 引用 {reference_id}")]
    DuplicateReference { item_id: i64, reference_id: String },

    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 系统错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Infrastructure(#[from] LoyaltyError),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, InventoryError>;

impl InventoryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ItemNotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientStock { .. }
            | Self::DuplicateReference { .. }
            | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateSku(_) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Infrastructure(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ItemNotFound(_) => "ITEM_NOT_FOUND",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::DuplicateSku(_) => "DUPLICATE_SKU",
            Self::DuplicateReference { .. } => "DUPLICATE_REFERENCE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Infrastructure(e) => e.code(),
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 基础设施故障可重试，业务规则错误重试结果不变
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) => true,
            Self::Infrastructure(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 唯一约束冲突映射为业务错误
    pub(crate) fn from_unique_violation(
        err: sqlx::Error,
        on_conflict: impl FnOnce(&str) -> Self,
    ) -> Self {
        let constraint = match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Some(db_err.constraint().unwrap_or_default().to_string())
            }
            _ => None,
        };
        match constraint {
            Some(constraint) => on_conflict(&constraint),
            None => Self::Database(err),
        }
    }
}

impl IntoResponse for InventoryError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            Self::Database(e) => {
                tracing::error!(error = %e, "数据库操作失败");
                "服务内部错误，请稍后重试".to_string()
            }
            Self::Infrastructure(e) => {
                tracing::error!(error = %e, "基础设施错误");
                "服务内部错误，请稍后重试".to_string()
            }
            Self::Internal(e) => {
                tracing::error!(error = %e, "内部错误");
                "服务内部错误，请稍后重试".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": message,
            "data": serde_json::Value::Null
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<validator::ValidationErrors> for InventoryError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}
