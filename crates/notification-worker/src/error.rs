//! 通知服务错误类型
//!
//! 区分渠道发送失败（可重试）与无法识别的事件（直接拒绝），
//! 由 `HandlerError` 转换决定消息的去向。

use loyalty_shared::bus::HandlerError;
use loyalty_shared::error::LoyaltyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("通知发送失败: 渠道={channel}, 原因={reason}")]
    SendFailed { channel: String, reason: String },

    #[error("所有渠道发送失败: {notification_id}")]
    AllChannelsFailed { notification_id: String },

    #[error("无法生成通知的事件: {exchange}/{routing_key}")]
    UnsupportedEvent {
        exchange: String,
        routing_key: String,
    },

    #[error(transparent)]
    Shared(#[from] LoyaltyError),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

impl From<NotificationError> for HandlerError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::SendFailed { .. } | NotificationError::AllChannelsFailed { .. } => {
                HandlerError::Retryable(err.to_string())
            }
            NotificationError::UnsupportedEvent { .. } => HandlerError::Rejected(err.to_string()),
            NotificationError::Shared(e) => e.into(),
        }
    }
}
