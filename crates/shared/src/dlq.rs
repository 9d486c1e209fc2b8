//! 死信队列
//!
//! 被拒绝或重试耗尽的消息写入 `loyalty.dlq`，附带来源队列、失败原因和重放计划。
//! DLQ 消费者在计划时间到达后把原始事件重放给原队列（通过 `target-queue` 头，
//! 不会再次扇出到其他队列）；超过重放上限的消息只记录日志，等待人工处理。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::KafkaConfig;
use crate::error::LoyaltyError;
use crate::kafka::{ConsumerMessage, KafkaConsumer, KafkaProducer, headers, topics};
use crate::retry::{RetryPolicy, retry_with_policy};

// ---------------------------------------------------------------------------
// DeadLetterMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始事件 ID
    pub message_id: String,
    /// 处理失败的队列
    pub queue: String,
    pub source_exchange: String,
    pub routing_key: String,
    /// 原始事件信封（JSON）
    pub payload: String,
    pub error: String,
    /// 已从死信重放的次数
    pub retry_count: u32,
    pub max_retries: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// None 表示不再重放
    pub next_retry_at: Option<DateTime<Utc>>,
    pub source_service: String,
}

impl DeadLetterMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: impl Into<String>,
        queue: impl Into<String>,
        source_exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<String>,
        error: impl Into<String>,
        retry_count: u32,
        policy: &RetryPolicy,
        source_service: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut msg = Self {
            message_id: message_id.into(),
            queue: queue.into(),
            source_exchange: source_exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            error: error.into(),
            retry_count,
            max_retries: policy.max_retries,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: None,
            source_service: source_service.into(),
        };
        msg.schedule(policy);
        msg
    }

    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 是否到达重放时间
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| now >= at)
    }

    fn schedule(&mut self, policy: &RetryPolicy) {
        self.next_retry_at = if self.should_retry() {
            let delay = policy.delay_for_attempt(self.retry_count);
            Some(self.last_failed_at + chrono::Duration::from_std(delay).unwrap_or_default())
        } else {
            None
        };
    }

    /// 重放时附加的消息头
    pub fn replay_headers(&self) -> HashMap<String, String> {
        HashMap::from([
            (headers::ROUTING_KEY.to_string(), self.routing_key.clone()),
            (headers::EVENT_ID.to_string(), self.message_id.clone()),
            (headers::TARGET_QUEUE.to_string(), self.queue.clone()),
            (
                headers::DLQ_RETRY_COUNT.to_string(),
                (self.retry_count + 1).to_string(),
            ),
        ])
    }
}

// ---------------------------------------------------------------------------
// DlqProducer
// ---------------------------------------------------------------------------

/// 写入死信队列
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    source_service: String,
    /// 死信重放计划
    replay_policy: RetryPolicy,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, source_service: &str, replay_policy: RetryPolicy) -> Self {
        Self {
            producer,
            source_service: source_service.to_string(),
            replay_policy,
        }
    }

    /// 写入死信，Kafka 瞬时故障时按默认策略重试
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        queue: &str,
        message_id: &str,
        source_exchange: &str,
        routing_key: &str,
        payload: String,
        error: &str,
        retry_count: u32,
    ) -> Result<(), LoyaltyError> {
        let dlq_msg = DeadLetterMessage::new(
            message_id,
            queue,
            source_exchange,
            routing_key,
            payload,
            error,
            retry_count,
            &self.replay_policy,
            &self.source_service,
        );

        self.park(&dlq_msg).await?;

        warn!(
            message_id,
            queue,
            routing_key,
            retry_count,
            next_retry_at = ?dlq_msg.next_retry_at,
            error,
            "消息已写入死信队列"
        );
        Ok(())
    }

    async fn park(&self, dlq_msg: &DeadLetterMessage) -> Result<(), LoyaltyError> {
        let producer = &self.producer;
        retry_with_policy(
            &RetryPolicy::default(),
            "dlq_send",
            LoyaltyError::is_retryable,
            move || producer.send_json(topics::DEAD_LETTER_QUEUE, &dlq_msg.message_id, dlq_msg),
        )
        .await
        .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// DlqConsumer
// ---------------------------------------------------------------------------

/// 死信重放消费者
pub struct DlqConsumer {
    consumer: KafkaConsumer,
    producer: DlqProducer,
}

impl DlqConsumer {
    /// 使用 `{consumer_group}.dlq` 消费组，全局只需一组实例
    pub fn new(config: &KafkaConfig, producer: DlqProducer) -> Result<Self, LoyaltyError> {
        let consumer = KafkaConsumer::new(config, Some("dlq"))?;
        consumer.subscribe(&[topics::DEAD_LETTER_QUEUE])?;

        Ok(Self { consumer, producer })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let producer = self.producer.clone();
        let watcher = shutdown.clone();

        self.consumer
            .start(shutdown, move |msg| {
                let producer = producer.clone();
                let shutdown = watcher.clone();
                async move { handle_dlq_message(&msg, &producer, shutdown).await }
            })
            .await;

        info!("DLQ 消费循环已退出");
    }
}

/// 等待计划时间后重放；等待期间关闭则重新写回死信队列
async fn handle_dlq_message(
    msg: &ConsumerMessage,
    producer: &DlqProducer,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LoyaltyError> {
    let dlq_msg: DeadLetterMessage = msg.deserialize_payload()?;

    if !dlq_msg.should_retry() {
        error!(
            message_id = %dlq_msg.message_id,
            queue = %dlq_msg.queue,
            routing_key = %dlq_msg.routing_key,
            source_service = %dlq_msg.source_service,
            retry_count = dlq_msg.retry_count,
            first_failed_at = %dlq_msg.first_failed_at,
            error = %dlq_msg.error,
            "死信消息已耗尽重放次数，需人工介入"
        );
        return Ok(());
    }

    let wait = dlq_msg
        .next_retry_at
        .and_then(|at| (at - Utc::now()).to_std().ok())
        .unwrap_or_default();

    if !wait.is_zero() {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                return producer.park(&dlq_msg).await;
            }

            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!(
        message_id = %dlq_msg.message_id,
        queue = %dlq_msg.queue,
        retry_count = dlq_msg.retry_count,
        "重放死信消息"
    );

    producer
        .producer
        .send(
            &dlq_msg.source_exchange,
            &dlq_msg.message_id,
            dlq_msg.payload.as_bytes(),
            &dlq_msg.replay_headers(),
        )
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    fn message(retry_count: u32, max_retries: u32) -> DeadLetterMessage {
        DeadLetterMessage::new(
            "evt-001",
            "inventory.reward-claims",
            "reward.events",
            "reward.claimed",
            r#"{"eventId":"evt-001"}"#,
            "库存不足",
            retry_count,
            &policy(max_retries),
            "inventory-service",
        )
    }

    #[test]
    fn test_first_dead_letter_is_scheduled() {
        let msg = message(0, 3);
        assert!(msg.should_retry());
        assert_eq!(
            msg.next_retry_at,
            Some(msg.last_failed_at + chrono::Duration::seconds(10))
        );
        assert!(!msg.is_due(msg.last_failed_at));
        assert!(msg.is_due(msg.last_failed_at + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_backoff_grows_with_retry_count() {
        let msg = message(2, 3);
        assert_eq!(
            msg.next_retry_at,
            Some(msg.last_failed_at + chrono::Duration::seconds(40))
        );
    }

    #[test]
    fn test_exhausted_message_is_not_scheduled() {
        let msg = message(3, 3);
        assert!(!msg.should_retry());
        assert!(msg.next_retry_at.is_none());
        assert!(!msg.is_due(Utc::now()));
    }

    #[test]
    fn test_replay_headers_target_original_queue() {
        let headers = message(1, 3).replay_headers();
        assert_eq!(headers[headers::TARGET_QUEUE], "inventory.reward-claims");
        assert_eq!(headers[headers::ROUTING_KEY], "reward.claimed");
        assert_eq!(headers[headers::DLQ_RETRY_COUNT], "2");
    }

    #[test]
    fn test_serialization_is_camel_case() {
        let json = serde_json::to_value(message(0, 3)).unwrap();
        assert_eq!(json["messageId"], "evt-001");
        assert_eq!(json["sourceExchange"], "reward.events");
        assert_eq!(json["retryCount"], 0);
        assert!(json["nextRetryAt"].is_string());
    }
}
