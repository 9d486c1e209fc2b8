//! 事件总线抽象
//!
//! 以 topic 交换机 + 持久队列的模型描述服务间的事件编排：
//! 发布方只把事件投递到所属领域的交换机，消费方各自声明队列并按路由键绑定。
//!
//! - `EventPublisher` / `EventHandler` 是服务代码依赖的两个接缝
//! - `InMemoryBus` 在进程内实现完整语义（扇出、确认、重新入队、死信），
//!   用于测试和单机编排
//! - Kafka 实现见 `kafka` 模块，单条消息的重试策略由 `deliver_with_retry` 统一

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::error::LoyaltyError;
use crate::events::EventEnvelope;
use crate::observability::metrics;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// 发布与处理接口
// ---------------------------------------------------------------------------

/// 事件发布者
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 将事件投递到信封指定的交换机
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), LoyaltyError>;
}

/// 处理器失败类型
///
/// `Retryable` 会被重新入队；`Rejected` 表示消息本身无法处理（毒消息、业务冲突），
/// 重试不会改变结果，直接转入死信。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("处理失败，可重试: {0}")]
    Retryable(String),

    #[error("消息被拒绝: {0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<LoyaltyError> for HandlerError {
    fn from(err: LoyaltyError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}

/// 事件处理器
///
/// 仅在返回 `Ok` 后消息才会被确认。
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

// ---------------------------------------------------------------------------
// 队列绑定与路由键匹配
// ---------------------------------------------------------------------------

/// 队列绑定
///
/// 一个队列绑定到一个交换机上的若干路由键模式。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_keys: Vec::new(),
        }
    }

    /// 追加一个路由键模式
    pub fn bind(mut self, pattern: impl Into<String>) -> Self {
        self.routing_keys.push(pattern.into());
        self
    }

    /// 该绑定是否接收指定交换机上的路由键
    pub fn accepts(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange == exchange
            && self
                .routing_keys
                .iter()
                .any(|pattern| routing_key_matches(pattern, routing_key))
    }
}

/// topic 交换机的路由键匹配
///
/// 以 `.` 分词，`*` 匹配恰好一个词，`#` 匹配零个或多个词。
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && match_words(rest, &words[1..]),
    }
}

// ---------------------------------------------------------------------------
// 单条消息的投递策略
// ---------------------------------------------------------------------------

/// 单条消息的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 处理成功，可以提交
    Acked { attempts: u32 },
    /// 被拒绝或重试耗尽，应转入死信后提交
    DeadLettered { attempts: u32, reason: String },
    /// 退避等待期间收到关闭信号，不提交，重启后重新投递
    Interrupted { attempts: u32 },
}

/// 按重试策略投递一条消息
///
/// 可重试失败按指数退避原地重试，保证同一队列内消息顺序。
/// 未启用死信时无限重试；启用后超过 `policy.max_retries` 转入死信。
pub async fn deliver_with_retry(
    handler: &dyn EventHandler,
    event: &EventEnvelope,
    policy: &RetryPolicy,
    dead_letter_enabled: bool,
    shutdown: &mut watch::Receiver<bool>,
) -> DeliveryOutcome {
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let reason = match handler.handle(event).await {
            Ok(()) => return DeliveryOutcome::Acked { attempts },
            Err(HandlerError::Rejected(reason)) => {
                return DeliveryOutcome::DeadLettered { attempts, reason };
            }
            Err(HandlerError::Retryable(reason)) => reason,
        };

        let retry_index = attempts - 1;
        if dead_letter_enabled && !policy.should_retry(retry_index) {
            return DeliveryOutcome::DeadLettered { attempts, reason };
        }

        let delay = policy.delay_for_attempt(retry_index);
        warn!(
            event_id = %event.event_id,
            routing_key = %event.routing_key,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "事件处理失败，退避后重试"
        );

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return DeliveryOutcome::Interrupted { attempts };
                }
            }

            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryBus
// ---------------------------------------------------------------------------

/// 队列中的一次投递
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    /// 已投递次数，重新入队后递增
    pub delivery_count: u32,
}

/// 进入死信的消息
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub envelope: EventEnvelope,
    pub reason: String,
    pub delivery_count: u32,
}

/// 消费一条消息后的确认方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Requeue,
    DeadLetter,
}

#[derive(Default)]
struct BusState {
    bindings: Vec<QueueBinding>,
    queues: HashMap<String, VecDeque<Delivery>>,
    dead_letters: Vec<DeadLetter>,
}

/// 进程内事件总线
///
/// 语义与 topic 交换机一致：发布时复制到所有匹配的队列，没有绑定的事件被丢弃。
/// 每个队列由单个消费循环顺序处理；失败的消息放回队首重新投递。
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    /// 单条消息最大投递次数，None 表示无限重新入队
    max_deliveries: Option<u32>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 超过投递次数的消息转入死信
    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: Some(max_deliveries.max(1)),
            ..Self::default()
        }
    }

    /// 声明持久队列并绑定
    ///
    /// 重复声明是幂等的：同一队列在同一交换机上的绑定会被合并。
    pub fn declare_queue(&self, binding: QueueBinding) {
        let mut state = self.state.lock();
        state.queues.entry(binding.queue.clone()).or_default();

        if let Some(existing) = state
            .bindings
            .iter_mut()
            .find(|b| b.queue == binding.queue && b.exchange == binding.exchange)
        {
            for key in binding.routing_keys {
                if !existing.routing_keys.contains(&key) {
                    existing.routing_keys.push(key);
                }
            }
        } else {
            info!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_keys = ?binding.routing_keys,
                "队列已声明并绑定"
            );
            state.bindings.push(binding);
        }
    }

    /// 队列中待处理的消息数
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    /// 取出并处理队首消息，队列为空时返回 None
    pub async fn consume_next(
        &self,
        queue: &str,
        handler: &dyn EventHandler,
    ) -> Option<Acknowledgement> {
        let delivery = {
            let mut state = self.state.lock();
            let mut delivery = state.queues.get_mut(queue)?.pop_front()?;
            delivery.delivery_count += 1;
            delivery
        };

        let routing_key = delivery.envelope.routing_key.clone();
        let result = handler.handle(&delivery.envelope).await;

        let ack = match result {
            Ok(()) => {
                debug!(queue, event_id = %delivery.envelope.event_id, "消息已确认");
                Acknowledgement::Ack
            }
            Err(HandlerError::Retryable(reason))
                if self
                    .max_deliveries
                    .is_none_or(|max| delivery.delivery_count < max) =>
            {
                warn!(
                    queue,
                    event_id = %delivery.envelope.event_id,
                    delivery_count = delivery.delivery_count,
                    error = %reason,
                    "消息处理失败，重新入队"
                );
                let mut state = self.state.lock();
                state
                    .queues
                    .entry(queue.to_string())
                    .or_default()
                    .push_front(delivery);
                Acknowledgement::Requeue
            }
            Err(err) => {
                error!(
                    queue,
                    event_id = %delivery.envelope.event_id,
                    delivery_count = delivery.delivery_count,
                    error = %err,
                    "消息转入死信"
                );
                let reason = err.to_string();
                let mut state = self.state.lock();
                state.dead_letters.push(DeadLetter {
                    queue: queue.to_string(),
                    envelope: delivery.envelope,
                    reason,
                    delivery_count: delivery.delivery_count,
                });
                metrics::record_event_dead_lettered(queue);
                Acknowledgement::DeadLetter
            }
        };

        let outcome = match ack {
            Acknowledgement::Ack => "ack",
            Acknowledgement::Requeue => "requeue",
            Acknowledgement::DeadLetter => "dead_letter",
        };
        metrics::record_event_consumed(queue, &routing_key, outcome);

        Some(ack)
    }

    /// 处理队列直到为空，返回投递次数
    ///
    /// 处理器持续失败且未设置投递上限时不会返回。
    pub async fn drain(&self, queue: &str, handler: &dyn EventHandler) -> usize {
        let mut deliveries = 0;
        while self.consume_next(queue, handler).await.is_some() {
            deliveries += 1;
        }
        deliveries
    }

    /// 队列的后台消费循环，直到收到关闭信号
    pub async fn run_consumer(
        &self,
        queue: String,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(queue = %queue, "内存队列消费循环已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // 先登记唤醒，再检查队列，避免错过检查与等待之间的发布
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.consume_next(&queue, handler.as_ref()).await {
                Some(Acknowledgement::Requeue) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Some(_) => {}
                None => {
                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }

                        _ = &mut notified => {}
                    }
                }
            }
        }

        info!(queue = %queue, "内存队列消费循环已退出");
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), LoyaltyError> {
        let routed = {
            let mut state = self.state.lock();
            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.accepts(&envelope.exchange, &envelope.routing_key))
                .map(|b| b.queue.clone())
                .collect();

            for queue in &targets {
                state
                    .queues
                    .entry(queue.clone())
                    .or_default()
                    .push_back(Delivery {
                        envelope: envelope.clone(),
                        delivery_count: 0,
                    });
            }
            targets.len()
        };

        if routed == 0 {
            debug!(
                exchange = %envelope.exchange,
                routing_key = %envelope.routing_key,
                "没有队列绑定该路由键，事件被丢弃"
            );
        }

        metrics::record_event_published(&envelope.exchange, &envelope.routing_key, "ok");
        self.notify.notify_waiters();
        Ok(())
    }
}
