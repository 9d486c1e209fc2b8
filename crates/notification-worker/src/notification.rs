//! 通知模型
//!
//! 领域事件到通知的映射：每种事件决定通知类型、接收方和投递渠道，
//! 标题和正文由模板引擎根据事件负载渲染。

use chrono::{DateTime, Utc};
use loyalty_shared::events::{
    ArticleCreated, ClaimStatusUpdated, EventEnvelope, FeedbackResponded, LowStock, RewardClaimed,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NotificationError, Result};
use crate::templates::NotificationTemplateEngine;

/// 库存预警的接收方
pub const ADMIN_RECIPIENT: &str = "admin";
/// 全体用户
pub const BROADCAST_RECIPIENT: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    AppPush,
    Email,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppPush => "APP_PUSH",
            Self::Email => "EMAIL",
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    RewardClaimed,
    ClaimStatusUpdated,
    FeedbackResponded,
    ArticlePublished,
    LowStock,
}

/// 待发送的通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    /// 来源事件，便于追溯
    pub event_id: String,
    pub recipient: String,
    pub notification_type: NotificationType,
    pub title: String,
    pub body: String,
    /// 渲染模板使用的事件负载
    pub data: serde_json::Value,
    pub channels: Vec<NotificationChannel>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// 根据事件生成通知
    ///
    /// 负载先按路由键对应的类型解码，结构不合法的事件在这里被拒绝。
    pub fn from_event(envelope: &EventEnvelope) -> Result<Self> {
        use NotificationChannel::{AppPush, Email};

        let (notification_type, recipient, channels) = if envelope.is::<RewardClaimed>() {
            let event: RewardClaimed = envelope.decode()?;
            (NotificationType::RewardClaimed, event.user_id, vec![AppPush, Email])
        } else if envelope.is::<ClaimStatusUpdated>() {
            let event: ClaimStatusUpdated = envelope.decode()?;
            (
                NotificationType::ClaimStatusUpdated,
                event.user_id,
                vec![AppPush, Email],
            )
        } else if envelope.is::<FeedbackResponded>() {
            let event: FeedbackResponded = envelope.decode()?;
            (NotificationType::FeedbackResponded, event.user_id, vec![AppPush])
        } else if envelope.is::<ArticleCreated>() {
            let _: ArticleCreated = envelope.decode()?;
            (
                NotificationType::ArticlePublished,
                BROADCAST_RECIPIENT.to_string(),
                vec![AppPush],
            )
        } else if envelope.is::<LowStock>() {
            let _: LowStock = envelope.decode()?;
            (
                NotificationType::LowStock,
                ADMIN_RECIPIENT.to_string(),
                vec![Email],
            )
        } else {
            return Err(NotificationError::UnsupportedEvent {
                exchange: envelope.exchange.clone(),
                routing_key: envelope.routing_key.clone(),
            });
        };

        let data = envelope.payload.clone();
        Ok(Self {
            notification_id: Uuid::now_v7().to_string(),
            event_id: envelope.event_id.clone(),
            recipient,
            notification_type,
            title: NotificationTemplateEngine::render_title(&notification_type, &data),
            body: NotificationTemplateEngine::render_body(&notification_type, &data),
            data,
            channels,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty_shared::events::StockUpdated;

    fn claimed() -> EventEnvelope {
        let event = RewardClaimed {
            claim_id: 3,
            user_id: "u-1".to_string(),
            reward_id: 9,
            points: 150,
            created_at: Utc::now(),
        };
        EventEnvelope::new(&event, "reward-service").unwrap()
    }

    #[test]
    fn test_reward_claimed_goes_to_user_on_all_channels() {
        let envelope = claimed();
        let notification = Notification::from_event(&envelope).unwrap();

        assert_eq!(notification.recipient, "u-1");
        assert_eq!(notification.event_id, envelope.event_id);
        assert_eq!(notification.notification_type, NotificationType::RewardClaimed);
        assert_eq!(
            notification.channels,
            vec![NotificationChannel::AppPush, NotificationChannel::Email]
        );
        assert!(notification.body.contains("#3"));
    }

    #[test]
    fn test_low_stock_goes_to_admin_by_email() {
        let event = LowStock {
            item_id: 5,
            name: "Mug".to_string(),
            sku: "MUG-01".to_string(),
            current_stock: 2,
            minimum_stock: 5,
            deficit: 3,
            reorder_quantity: 13,
        };
        let envelope = EventEnvelope::new(&event, "inventory-service").unwrap();
        let notification = Notification::from_event(&envelope).unwrap();

        assert_eq!(notification.recipient, ADMIN_RECIPIENT);
        assert_eq!(notification.channels, vec![NotificationChannel::Email]);
        assert!(notification.body.contains("MUG-01"));
    }

    #[test]
    fn test_article_is_broadcast() {
        let event = ArticleCreated {
            article_id: 1,
            title: "积分规则更新".to_string(),
            author: None,
            created_at: None,
        };
        let envelope = EventEnvelope::new(&event, "article-service").unwrap();
        let notification = Notification::from_event(&envelope).unwrap();

        assert_eq!(notification.recipient, BROADCAST_RECIPIENT);
        assert!(notification.body.contains("积分规则更新"));
    }

    #[test]
    fn test_stock_updated_is_unsupported() {
        let event = StockUpdated {
            transaction_id: 1,
            item_id: 2,
            change_type: "DECREASE".to_string(),
            quantity: 1,
            previous_qty: 3,
            new_qty: 2,
            reason: "claim".to_string(),
            reference_id: None,
            performed_by: "system".to_string(),
            created_at: Utc::now(),
        };
        let envelope = EventEnvelope::new(&event, "inventory-service").unwrap();

        let err = Notification::from_event(&envelope).unwrap_err();
        assert!(matches!(err, NotificationError::UnsupportedEvent { .. }));
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let mut envelope = claimed();
        envelope.payload = serde_json::json!({ "claim_id": "not-a-number" });

        let err = Notification::from_event(&envelope).unwrap_err();
        assert!(matches!(err, NotificationError::Shared(_)));
    }
}
