//! Kafka 基础设施封装
//!
//! 将 rdkafka 封装为总线语义：
//! - 交换机映射为同名 topic，路由键放在 `routing-key` 消息头
//! - 消息 key 为聚合根 ID，同一聚合的事件落在同一分区，保证顺序
//! - 队列映射为消费组 `{consumer_group}.{queue}`，处理成功后才手动提交 offset

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::bus::{DeliveryOutcome, EventHandler, EventPublisher, QueueBinding, deliver_with_retry};
use crate::config::KafkaConfig;
use crate::dlq::DlqProducer;
use crate::error::LoyaltyError;
use crate::events::EventEnvelope;
use crate::observability::metrics;
use crate::observability::tracing::{extract_from_headers, inject_to_headers};
use crate::retry::{RetryPolicy, retry_until_shutdown};

// ---------------------------------------------------------------------------
// Topic 与消息头
// ---------------------------------------------------------------------------

pub mod topics {
    pub const DEAD_LETTER_QUEUE: &str = "loyalty.dlq";
}

pub mod headers {
    pub const ROUTING_KEY: &str = "routing-key";
    pub const EVENT_ID: &str = "event-id";
    /// 死信重放时只投递给原队列
    pub const TARGET_QUEUE: &str = "target-queue";
    /// 消息已从死信队列重放的次数
    pub const DLQ_RETRY_COUNT: &str = "dlq-retry-count";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息
///
/// 从 `BorrowedMessage` 复制出所有字段，可以跨 await 点传递。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn payload_str(&self) -> Result<&str, LoyaltyError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| LoyaltyError::Kafka(format!("负载非 UTF-8 编码: {e}")))
    }

    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, LoyaltyError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| LoyaltyError::Kafka(format!("负载反序列化失败: {e}")))
    }

    /// 从死信重放的次数，首次投递为 0
    pub fn dlq_retry_count(&self) -> u32 {
        self.header(headers::DLQ_RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// Kafka 生产者
///
/// `FutureProducer` 内部是 Arc，Clone 开销很小。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 开启幂等写入，5 秒内无法投递即返回错误，由上层重试
    pub fn new(config: &KafkaConfig) -> Result<Self, LoyaltyError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| LoyaltyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<(i32, i64), LoyaltyError> {
        let owned = headers.iter().fold(OwnedHeaders::new(), |acc, (k, v)| {
            acc.insert(Header {
                key: k.as_str(),
                value: Some(v.as_str()),
            })
        });

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(owned);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| LoyaltyError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), LoyaltyError> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload, &HashMap::new()).await
    }
}

// ---------------------------------------------------------------------------
// KafkaEventPublisher
// ---------------------------------------------------------------------------

/// 事件发布者的 Kafka 实现
#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: KafkaProducer,
}

impl KafkaEventPublisher {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }

    /// 事件对应的消息头：路由键、事件 ID 和追踪上下文
    pub fn message_headers(envelope: &EventEnvelope) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        inject_to_headers(&mut headers);
        headers.insert(headers::ROUTING_KEY.to_string(), envelope.routing_key.clone());
        headers.insert(headers::EVENT_ID.to_string(), envelope.event_id.clone());
        headers
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), LoyaltyError> {
        let payload = envelope.to_bytes()?;
        let result = self
            .producer
            .send(
                &envelope.exchange,
                &envelope.aggregate_id,
                &payload,
                &Self::message_headers(envelope),
            )
            .await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::record_event_published(&envelope.exchange, &envelope.routing_key, outcome);

        result.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 通用 Kafka 消费者，自动提交 offset
///
/// handler 返回错误只记录日志，不中断循环。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// `group_id_suffix` 让同一服务内不同的消费逻辑使用独立消费组
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, LoyaltyError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| LoyaltyError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), LoyaltyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| LoyaltyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), LoyaltyError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            if let Err(e) = handler(msg).await {
                                error!(error = %e, "处理 Kafka 消息失败");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaQueueConsumer
// ---------------------------------------------------------------------------

/// 单条消息处理后的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Commit,
    Stop,
}

/// 待写入死信队列的一条消息
struct DeadLetterEntry<'a> {
    message_id: &'a str,
    source_exchange: &'a str,
    routing_key: &'a str,
    payload: String,
    reason: &'a str,
    retry_count: u32,
}

/// 死信发送一直重试到成功；只有关闭信号能让消费循环停在这条消息上
async fn dead_letter_flow<F, Fut>(
    queue: &str,
    message_id: &str,
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
    send: F,
) -> Flow
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), LoyaltyError>>,
{
    match retry_until_shutdown(policy, "dlq_send", shutdown, send).await {
        Some(()) => {
            metrics::record_event_dead_lettered(queue);
            Flow::Commit
        }
        None => {
            // 不提交 offset，重启后重新投递
            warn!(queue, message_id, "写入死信队列期间收到关闭信号");
            Flow::Stop
        }
    }
}

/// 按队列绑定消费事件
///
/// 消息在处理成功（或成功转入死信）后才提交 offset；
/// 进程在处理中途退出时，消息会在重启后重新投递。
pub struct KafkaQueueConsumer {
    consumer: StreamConsumer,
    binding: QueueBinding,
}

impl KafkaQueueConsumer {
    pub fn new(config: &KafkaConfig, binding: QueueBinding) -> Result<Self, LoyaltyError> {
        let group_id = format!("{}.{}", config.consumer_group, binding.queue);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| LoyaltyError::Kafka(format!("创建消费者失败: {e}")))?;

        consumer
            .subscribe(&[binding.exchange.as_str()])
            .map_err(|e| LoyaltyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(
            group_id,
            exchange = %binding.exchange,
            routing_keys = ?binding.routing_keys,
            "队列消费者已创建"
        );

        Ok(Self { consumer, binding })
    }

    /// 消费循环，直到收到关闭信号
    ///
    /// `dead_letter` 为 None 时可重试失败会无限重试，被拒绝的消息记录日志后丢弃。
    pub async fn run(
        self,
        handler: Arc<dyn EventHandler>,
        policy: RetryPolicy,
        dead_letter: Option<DlqProducer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        use futures::StreamExt;

        let queue = self.binding.queue.clone();
        info!(queue = %queue, "队列消费循环已启动");

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        loop {
            let msg = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }

                next = stream.next() => match next {
                    None => {
                        warn!(queue = %queue, "Kafka 消息流意外结束");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "接收 Kafka 消息出错");
                        continue;
                    }
                    Some(Ok(borrowed)) => ConsumerMessage::from_borrowed(&borrowed),
                },
            };

            let flow = self
                .process(&msg, handler.as_ref(), &policy, dead_letter.as_ref(), &mut shutdown)
                .await;

            match flow {
                Flow::Commit => {
                    if let Err(e) = self.commit(&msg) {
                        error!(queue = %queue, offset = msg.offset, error = %e, "提交 offset 失败");
                    }
                }
                Flow::Stop => break,
            }
        }

        info!(queue = %queue, "队列消费循环已退出");
    }

    async fn process(
        &self,
        msg: &ConsumerMessage,
        handler: &dyn EventHandler,
        policy: &RetryPolicy,
        dead_letter: Option<&DlqProducer>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        let queue = self.binding.queue.as_str();

        if let Some(target) = msg.header(headers::TARGET_QUEUE)
            && target != queue
        {
            return Flow::Commit;
        }

        let envelope = match EventEnvelope::from_bytes(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue, offset = msg.offset, error = %e, "无法解析事件信封");
                let routing_key = msg.header(headers::ROUTING_KEY).unwrap_or("unknown");
                let message_id = msg
                    .header(headers::EVENT_ID)
                    .map(String::from)
                    .unwrap_or_else(|| format!("{}-{}-{}", msg.topic, msg.partition, msg.offset));
                let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                return self
                    .dead_letter(
                        dead_letter,
                        DeadLetterEntry {
                            message_id: &message_id,
                            source_exchange: &msg.topic,
                            routing_key,
                            payload,
                            reason: &e.to_string(),
                            retry_count: msg.dlq_retry_count(),
                        },
                        policy,
                        shutdown,
                    )
                    .await;
            }
        };

        if !self.binding.accepts(&msg.topic, &envelope.routing_key) {
            debug!(queue, routing_key = %envelope.routing_key, "路由键未绑定，跳过");
            return Flow::Commit;
        }

        let span = info_span!(
            "consume_event",
            queue,
            routing_key = %envelope.routing_key,
            event_id = %envelope.event_id,
        );
        if msg.headers.contains_key("traceparent") {
            let _ = span.set_parent(extract_from_headers(&msg.headers));
        }

        let outcome = deliver_with_retry(handler, &envelope, policy, dead_letter.is_some(), shutdown)
            .instrument(span)
            .await;

        match outcome {
            DeliveryOutcome::Acked { attempts } => {
                debug!(queue, event_id = %envelope.event_id, attempts, "事件处理成功");
                metrics::record_event_consumed(queue, &envelope.routing_key, "ack");
                Flow::Commit
            }
            DeliveryOutcome::DeadLettered { reason, .. } => {
                metrics::record_event_consumed(queue, &envelope.routing_key, "dead_letter");
                // 原始消息体就是可解析的信封
                let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                self.dead_letter(
                    dead_letter,
                    DeadLetterEntry {
                        message_id: &envelope.event_id,
                        source_exchange: &envelope.exchange,
                        routing_key: &envelope.routing_key,
                        payload,
                        reason: &reason,
                        retry_count: msg.dlq_retry_count(),
                    },
                    policy,
                    shutdown,
                )
                .await
            }
            DeliveryOutcome::Interrupted { .. } => Flow::Stop,
        }
    }

    /// 写入死信队列
    ///
    /// 发送失败时在原地退避重试，offset 保持不提交，后续消息不会越过这一条。
    async fn dead_letter(
        &self,
        dead_letter: Option<&DlqProducer>,
        entry: DeadLetterEntry<'_>,
        policy: &RetryPolicy,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        let queue = self.binding.queue.as_str();

        let Some(dlq) = dead_letter else {
            error!(
                queue,
                message_id = entry.message_id,
                error = entry.reason,
                "消息被拒绝且未启用死信，丢弃"
            );
            return Flow::Commit;
        };

        dead_letter_flow(
            queue,
            entry.message_id,
            policy,
            shutdown,
            || {
                dlq.send(
                    queue,
                    entry.message_id,
                    entry.source_exchange,
                    entry.routing_key,
                    entry.payload.clone(),
                    entry.reason,
                    entry.retry_count,
                )
            },
        )
        .await
    }

    fn commit(&self, msg: &ConsumerMessage) -> Result<(), LoyaltyError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(|e| LoyaltyError::Kafka(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| LoyaltyError::Kafka(e.to_string()))
    }
}
