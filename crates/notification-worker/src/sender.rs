//! 多渠道通知发送器
//!
//! 通过 `NotificationSender` trait 抽象发送行为，APP 推送和邮件各有独立实现。
//! 当前实现只记录日志，接入真实推送服务时实现同一 trait 即可。

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::notification::{Notification, NotificationChannel};

/// 发送结果
pub struct SendResult {
    pub success: bool,
    pub channel: NotificationChannel,
    /// 外部渠道返回的消息标识
    pub message_id: Option<String>,
    pub error: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<SendResult>;

    fn channel(&self) -> NotificationChannel;
}

// ---------------------------------------------------------------------------
// APP 推送
// ---------------------------------------------------------------------------

pub struct AppPushSender;

#[async_trait]
impl NotificationSender for AppPushSender {
    async fn send(&self, notification: &Notification) -> Result<SendResult> {
        let message_id = Uuid::now_v7().to_string();

        info!(
            channel = "APP_PUSH",
            notification_id = %notification.notification_id,
            recipient = %notification.recipient,
            message_id = %message_id,
            title = %notification.title,
            "发送 APP 推送通知"
        );

        Ok(SendResult {
            success: true,
            channel: NotificationChannel::AppPush,
            message_id: Some(message_id),
            error: None,
        })
    }

    fn channel(&self) -> NotificationChannel {
        NotificationChannel::AppPush
    }
}

// ---------------------------------------------------------------------------
// 邮件
// ---------------------------------------------------------------------------

pub struct EmailSender;

#[async_trait]
impl NotificationSender for EmailSender {
    async fn send(&self, notification: &Notification) -> Result<SendResult> {
        let message_id = Uuid::now_v7().to_string();

        info!(
            channel = "EMAIL",
            notification_id = %notification.notification_id,
            recipient = %notification.recipient,
            message_id = %message_id,
            subject = %notification.title,
            body = %notification.body,
            "发送邮件通知"
        );

        Ok(SendResult {
            success: true,
            channel: NotificationChannel::Email,
            message_id: Some(message_id),
            error: None,
        })
    }

    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }
}
