//! 奖励领取服务错误类型
//!
//! 业务错误（不存在、冲突）是终态，不自动重试；
//! 积分服务不可用映射为 502，熔断期间为 503。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use loyalty_shared::error::LoyaltyError;
use loyalty_shared::tier::Tier;
use serde_json::json;
use thiserror::Error;

use crate::models::ClaimStatus;

#[derive(Debug, Error)]
pub enum ClaimError {
    // ==================== 不存在 ====================
    #[error("奖励不存在或已下架: {0}")]
    RewardNotFound(i64),

    #[error("领取记录不存在: {0}")]
    ClaimNotFound(i64),

    // ==================== 业务冲突 ====================
    #[error("奖励库存不足: {reward_id}")]
    InsufficientStock { reward_id: i64 },

    #[error("积分不足: 需要 {required}, 当前 {available}")]
    InsufficientPoints { required: i64, available: i64 },

    #[error("已领取过 {tier} 档位的奖励 (领取记录 {claim_id})")]
    TierAlreadyClaimed { tier: Tier, claim_id: i64 },

    #[error("领取状态不允许从 {from} 变更为 {to}")]
    InvalidClaimStatus { from: ClaimStatus, to: ClaimStatus },

    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 上游 ====================
    #[error("{service} 调用失败: {message}")]
    Upstream { service: String, message: String },

    #[error("{service} 暂不可用（熔断中）")]
    UpstreamUnavailable { service: String },

    // ==================== 系统错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Infrastructure(#[from] LoyaltyError),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClaimError>;

impl ClaimError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RewardNotFound(_) | Self::ClaimNotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientStock { .. }
            | Self::InsufficientPoints { .. }
            | Self::TierAlreadyClaimed { .. }
            | Self::InvalidClaimStatus { .. }
            | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Infrastructure(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RewardNotFound(_) => "REWARD_NOT_FOUND",
            Self::ClaimNotFound(_) => "CLAIM_NOT_FOUND",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::InsufficientPoints { .. } => "INSUFFICIENT_POINTS",
            Self::TierAlreadyClaimed { .. } => "TIER_ALREADY_CLAIMED",
            Self::InvalidClaimStatus { .. } => "INVALID_CLAIM_STATUS",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Infrastructure(e) => e.code(),
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) | Self::Upstream { .. } | Self::UpstreamUnavailable { .. } => true,
            Self::Infrastructure(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl IntoResponse for ClaimError {
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
            Self::Upstream { service, message } => {
                tracing::warn!(service = %service, error = %message, "上游服务调用失败");
                "积分服务暂时不可用，请稍后重试".to_string()
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

impl From<validator::ValidationErrors> for ClaimError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ClaimError::RewardNotFound(1).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ClaimError::InvalidClaimStatus {
                from: ClaimStatus::Rejected,
                to: ClaimStatus::Approved,
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ClaimError::Upstream {
                service: "point-service".to_string(),
                message: "connection refused".to_string(),
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ClaimError::UpstreamUnavailable {
                service: "point-service".to_string()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_conflicts_are_terminal() {
        let err = ClaimError::TierAlreadyClaimed {
            tier: Tier::Gold,
            claim_id: 3,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.error_code(), "TIER_ALREADY_CLAIMED");
        assert!(err.to_string().contains("GOLD"));
    }
}
