//! 通知消费者
//!
//! 每个领域一条队列，事件渲染为通知后分发到对应渠道的发送器。
//! 多渠道发送并行执行；只要有一个渠道成功即确认消息，全部失败时交给总线重新投递。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use loyalty_shared::bus::{EventHandler, HandlerError, QueueBinding};
use loyalty_shared::events::{EventEnvelope, exchanges, routing_keys};
use loyalty_shared::observability::metrics;
use tracing::{error, info, warn};

use crate::error::NotificationError;
use crate::notification::{Notification, NotificationChannel};
use crate::sender::{AppPushSender, EmailSender, NotificationSender, SendResult};

pub const REWARD_QUEUE: &str = "notification.reward";
pub const FEEDBACK_QUEUE: &str = "notification.feedback";
pub const ARTICLE_QUEUE: &str = "notification.article";
pub const INVENTORY_QUEUE: &str = "notification.inventory";

/// 通知工作者声明的全部队列绑定
pub fn queue_bindings() -> Vec<QueueBinding> {
    vec![
        QueueBinding::new(REWARD_QUEUE, exchanges::REWARD)
            .bind(routing_keys::REWARD_CLAIMED)
            .bind(routing_keys::CLAIM_STATUS_UPDATED),
        QueueBinding::new(FEEDBACK_QUEUE, exchanges::FEEDBACK)
            .bind(routing_keys::FEEDBACK_RESPONDED),
        QueueBinding::new(ARTICLE_QUEUE, exchanges::ARTICLE).bind(routing_keys::ARTICLE_CREATED),
        QueueBinding::new(INVENTORY_QUEUE, exchanges::INVENTORY).bind(routing_keys::LOW_STOCK),
    ]
}

pub type SenderRegistry = HashMap<NotificationChannel, Arc<dyn NotificationSender>>;

/// 默认渠道：APP 推送和邮件
pub fn default_senders() -> SenderRegistry {
    let push: Arc<dyn NotificationSender> = Arc::new(AppPushSender);
    let email: Arc<dyn NotificationSender> = Arc::new(EmailSender);
    HashMap::from([(push.channel(), push), (email.channel(), email)])
}

pub struct NotificationHandler {
    senders: SenderRegistry,
}

impl NotificationHandler {
    pub fn new(senders: SenderRegistry) -> Self {
        Self { senders }
    }

    async fn dispatch(&self, event: &EventEnvelope) -> Result<Notification, NotificationError> {
        let notification = Notification::from_event(event)?;

        info!(
            notification_id = %notification.notification_id,
            event_id = %event.event_id,
            recipient = %notification.recipient,
            notification_type = ?notification.notification_type,
            channels = ?notification.channels,
            "收到通知事件"
        );

        let results = handle_notification(&self.senders, &notification).await;

        for result in results.iter().filter(|r| !r.success) {
            warn!(
                notification_id = %notification.notification_id,
                channel = %result.channel,
                error = ?result.error,
                "渠道发送失败"
            );
        }

        let success_count = results.iter().filter(|r| r.success).count();
        if success_count == 0 {
            return Err(NotificationError::AllChannelsFailed {
                notification_id: notification.notification_id,
            });
        }

        info!(
            notification_id = %notification.notification_id,
            total_channels = results.len(),
            success_count,
            "通知事件处理完成"
        );
        Ok(notification)
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        self.dispatch(event).await.map(|_| ()).map_err(|e| {
            error!(
                event_id = %event.event_id,
                routing_key = %event.routing_key,
                error = %e,
                "处理通知事件失败"
            );
            HandlerError::from(e)
        })
    }
}

/// 按通知指定的渠道列表并行发送
///
/// 单个渠道的失败不会阻塞其他渠道。
pub async fn handle_notification(
    senders: &SenderRegistry,
    notification: &Notification,
) -> Vec<SendResult> {
    let futures: Vec<_> = notification
        .channels
        .iter()
        .map(|&channel| async move {
            let result = match senders.get(&channel) {
                Some(sender) => match sender.send(notification).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(channel = %channel, error = %e, "发送器执行异常");
                        SendResult {
                            success: false,
                            channel,
                            message_id: None,
                            error: Some(e.to_string()),
                        }
                    }
                },
                None => {
                    warn!(channel = %channel, "未找到该渠道的发送器，跳过");
                    SendResult {
                        success: false,
                        channel,
                        message_id: None,
                        error: Some("发送器未注册".to_string()),
                    }
                }
            };
            metrics::record_notification_sent(
                channel.as_str(),
                if result.success { "success" } else { "failed" },
            );
            result
        })
        .collect();

    futures::future::join_all(futures).await
}
