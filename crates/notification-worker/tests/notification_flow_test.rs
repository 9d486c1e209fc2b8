//! 通知队列端到端测试
//!
//! 事件经内存总线路由到通知队列，由幂等包装后的处理器消费。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use loyalty_shared::bus::{EventPublisher, InMemoryBus};
use loyalty_shared::events::{
    ArticleCreated, ClaimStatusUpdated, EventEnvelope, FeedbackCreated, FeedbackResponded,
    RewardClaimed,
};
use loyalty_shared::idempotency::{IdempotentHandler, MemoryProcessedEventStore};
use notification_worker::consumer::{
    ARTICLE_QUEUE, FEEDBACK_QUEUE, NotificationHandler, REWARD_QUEUE, SenderRegistry,
    queue_bindings,
};
use notification_worker::error::{NotificationError, Result};
use notification_worker::notification::{Notification, NotificationChannel};
use notification_worker::sender::{NotificationSender, SendResult};

/// 记录所有发出的通知，可切换为全部失败
struct RecordingSender {
    channel: NotificationChannel,
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl RecordingSender {
    fn new(channel: NotificationChannel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(false),
        })
    }

    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, notification: &Notification) -> Result<SendResult> {
        if *self.failing.lock().unwrap() {
            return Err(NotificationError::SendFailed {
                channel: self.channel.to_string(),
                reason: "gateway down".to_string(),
            });
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(SendResult {
            success: true,
            channel: self.channel,
            message_id: Some(notification.notification_id.clone()),
            error: None,
        })
    }

    fn channel(&self) -> NotificationChannel {
        self.channel
    }
}

struct Harness {
    bus: InMemoryBus,
    push: Arc<RecordingSender>,
    email: Arc<RecordingSender>,
    handler: Arc<NotificationHandler>,
    processed: Arc<MemoryProcessedEventStore>,
}

impl Harness {
    fn new() -> Self {
        let bus = InMemoryBus::with_max_deliveries(3);
        for binding in queue_bindings() {
            bus.declare_queue(binding);
        }

        let push = RecordingSender::new(NotificationChannel::AppPush);
        let email = RecordingSender::new(NotificationChannel::Email);
        let senders: SenderRegistry = HashMap::from([
            (
                NotificationChannel::AppPush,
                push.clone() as Arc<dyn NotificationSender>,
            ),
            (
                NotificationChannel::Email,
                email.clone() as Arc<dyn NotificationSender>,
            ),
        ]);

        Self {
            bus,
            push,
            email,
            handler: Arc::new(NotificationHandler::new(senders)),
            processed: Arc::new(MemoryProcessedEventStore::new()),
        }
    }

    async fn drain(&self, queue: &str) -> usize {
        let handler = IdempotentHandler::new(queue, self.handler.clone(), self.processed.clone());
        self.bus.drain(queue, &handler).await
    }
}

fn claimed(claim_id: i64) -> EventEnvelope {
    let event = RewardClaimed {
        claim_id,
        user_id: "u-1".to_string(),
        reward_id: 1,
        points: 100,
        created_at: Utc::now(),
    };
    EventEnvelope::new(&event, "reward-service").unwrap()
}

#[tokio::test]
async fn test_reward_events_notify_user() {
    let h = Harness::new();
    h.bus.publish(&claimed(1)).await.unwrap();
    let status = ClaimStatusUpdated {
        claim_id: 1,
        user_id: "u-1".to_string(),
        reward_id: 1,
        status: "REJECTED".to_string(),
        updated_at: Utc::now(),
    };
    h.bus
        .publish(&EventEnvelope::new(&status, "reward-service").unwrap())
        .await
        .unwrap();

    assert_eq!(h.drain(REWARD_QUEUE).await, 2);

    let pushed = h.push.sent();
    assert_eq!(pushed.len(), 2);
    assert_eq!(pushed[1].title, "奖励领取未通过");
    assert_eq!(h.email.sent().len(), 2);
}

#[tokio::test]
async fn test_redelivered_event_notifies_once() {
    let h = Harness::new();
    let envelope = claimed(2);
    h.bus.publish(&envelope).await.unwrap();
    h.bus.publish(&envelope).await.unwrap();

    h.drain(REWARD_QUEUE).await;

    assert_eq!(h.push.sent().len(), 1);
}

#[tokio::test]
async fn test_feedback_created_is_not_routed_to_notifications() {
    let h = Harness::new();
    let created = FeedbackCreated {
        feedback_id: 1,
        user_id: "u-1".to_string(),
        rating: None,
        created_at: None,
    };
    h.bus
        .publish(&EventEnvelope::new(&created, "feedback-service").unwrap())
        .await
        .unwrap();
    assert_eq!(h.bus.queue_depth(FEEDBACK_QUEUE), 0);

    let responded = FeedbackResponded {
        feedback_id: 1,
        user_id: "u-1".to_string(),
        response: Some("谢谢反馈".to_string()),
        responded_at: None,
    };
    h.bus
        .publish(&EventEnvelope::new(&responded, "feedback-service").unwrap())
        .await
        .unwrap();
    h.drain(FEEDBACK_QUEUE).await;

    let pushed = h.push.sent();
    assert_eq!(pushed.len(), 1);
    assert!(pushed[0].body.contains("谢谢反馈"));
    assert!(h.email.sent().is_empty());
}

#[tokio::test]
async fn test_all_channels_down_dead_letters_after_retries() {
    let h = Harness::new();
    h.push.set_failing(true);
    let article = ArticleCreated {
        article_id: 3,
        title: "春季活动".to_string(),
        author: Some("运营".to_string()),
        created_at: None,
    };
    h.bus
        .publish(&EventEnvelope::new(&article, "article-service").unwrap())
        .await
        .unwrap();

    assert_eq!(h.drain(ARTICLE_QUEUE).await, 3);

    let dead = h.bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].queue, ARTICLE_QUEUE);
    assert_eq!(dead[0].delivery_count, 3);
}

#[tokio::test]
async fn test_recovered_channel_delivers_on_retry() {
    let h = Harness::new();
    h.push.set_failing(true);
    h.email.set_failing(true);
    h.bus.publish(&claimed(5)).await.unwrap();

    let handler =
        IdempotentHandler::new(REWARD_QUEUE, h.handler.clone(), h.processed.clone());
    h.bus.consume_next(REWARD_QUEUE, &handler).await;
    assert_eq!(h.bus.queue_depth(REWARD_QUEUE), 1);

    h.push.set_failing(false);
    h.email.set_failing(false);
    h.bus.consume_next(REWARD_QUEUE, &handler).await;

    assert_eq!(h.bus.queue_depth(REWARD_QUEUE), 0);
    assert_eq!(h.push.sent().len(), 1);
    assert!(h.bus.dead_letters().is_empty());
}
