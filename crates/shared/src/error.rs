//! 统一错误处理模块
//!
//! 定义各服务共享的基础设施错误类型。业务错误由各服务自行定义，
//! 通过 `#[from]` 将本类型嵌入其中。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    // ==================== 存储错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    // ==================== 消息错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("事件总线错误: {0}")]
    EventBus(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("事件类型不匹配: {0}")]
    EventMismatch(String),

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    Upstream { service: String, message: String },

    #[error("外部服务超时: {service}")]
    UpstreamTimeout { service: String },

    // ==================== 通用错误 ====================
    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::EventBus(_) => "EVENT_BUS_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::EventMismatch(_) => "EVENT_MISMATCH",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 序列化失败属于毒消息，重试不会改变结果
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Redis(_)
                | Self::Kafka(_)
                | Self::EventBus(_)
                | Self::Upstream { .. }
                | Self::UpstreamTimeout { .. }
        )
    }
}

impl From<config::ConfigError> for LoyaltyError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
