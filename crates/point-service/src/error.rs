//! 积分服务错误类型

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use loyalty_shared::error::LoyaltyError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PointError {
    // ==================== 业务规则错误 ====================
    #[error("今日积分已达上限: {user_id}")]
    DailyLimitReached { user_id: String },

    #[error("反馈 {feedback_id} 已发放过积分")]
    AlreadyAwarded { user_id: String, feedback_id: i64 },

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

pub type Result<T> = std::result::Result<T, PointError>;

impl PointError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DailyLimitReached { .. } | Self::AlreadyAwarded { .. } | Self::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Database(_) | Self::Infrastructure(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DailyLimitReached { .. } => "DAILY_LIMIT_REACHED",
            Self::AlreadyAwarded { .. } => "ALREADY_AWARDED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Infrastructure(e) => e.code(),
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) => true,
            Self::Infrastructure(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 每日上限和重复反馈都是正常的业务结果
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            Self::DailyLimitReached { .. } | Self::AlreadyAwarded { .. }
        )
    }
}

impl IntoResponse for PointError {
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

impl From<validator::ValidationErrors> for PointError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}
