//! 消费端幂等
//!
//! 总线是至少一次投递，同一事件可能被重复消费。消费端按 (consumer, event_id)
//! 记录已处理事件，重复事件直接确认。业务表上的自然键唯一约束是第二道防线，
//! 处理器自身仍需容忍重复。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::bus::{EventHandler, HandlerError};
use crate::cache::{Cache, CacheKey};
use crate::error::Result;
use crate::events::EventEnvelope;

/// 已处理事件的保留时长
pub const PROCESSED_EVENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// 已处理事件记录
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn is_processed(&self, consumer: &str, event_id: &str) -> Result<bool>;

    async fn mark_processed(&self, consumer: &str, event_id: &str) -> Result<()>;
}

/// 基于 Redis SET NX EX 的实现，多实例共享
pub struct RedisProcessedEventStore {
    cache: Cache,
    ttl: Duration,
}

impl RedisProcessedEventStore {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            ttl: PROCESSED_EVENT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl ProcessedEventStore for RedisProcessedEventStore {
    async fn is_processed(&self, consumer: &str, event_id: &str) -> Result<bool> {
        self.cache
            .exists(&CacheKey::processed_event(consumer, event_id))
            .await
    }

    async fn mark_processed(&self, consumer: &str, event_id: &str) -> Result<()> {
        let key = CacheKey::processed_event(consumer, event_id);
        let inserted = self
            .cache
            .set_nx(&key, &Utc::now().to_rfc3339(), self.ttl)
            .await?;
        if !inserted {
            debug!(consumer, event_id, "事件已被其他实例标记为已处理");
        }
        Ok(())
    }
}

/// 进程内实现，用于测试和单实例部署
#[derive(Default)]
pub struct MemoryProcessedEventStore {
    processed: DashMap<(String, String), ()>,
}

impl MemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

#[async_trait]
impl ProcessedEventStore for MemoryProcessedEventStore {
    async fn is_processed(&self, consumer: &str, event_id: &str) -> Result<bool> {
        Ok(self
            .processed
            .contains_key(&(consumer.to_string(), event_id.to_string())))
    }

    async fn mark_processed(&self, consumer: &str, event_id: &str) -> Result<()> {
        self.processed
            .insert((consumer.to_string(), event_id.to_string()), ());
        Ok(())
    }
}

/// 幂等包装
///
/// 已处理的事件直接确认；处理成功后再标记。标记失败时返回可重试错误，
/// 重投递会被业务自然键挡住。
pub struct IdempotentHandler<H> {
    consumer: String,
    inner: H,
    store: Arc<dyn ProcessedEventStore>,
}

impl<H: EventHandler> IdempotentHandler<H> {
    pub fn new(consumer: impl Into<String>, inner: H, store: Arc<dyn ProcessedEventStore>) -> Self {
        Self {
            consumer: consumer.into(),
            inner,
            store,
        }
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for IdempotentHandler<H> {
    async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        if self
            .store
            .is_processed(&self.consumer, &event.event_id)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?
        {
            debug!(
                consumer = %self.consumer,
                event_id = %event.event_id,
                "重复事件，跳过"
            );
            return Ok(());
        }

        self.inner.handle(event).await?;

        if let Err(e) = self.store.mark_processed(&self.consumer, &event.event_id).await {
            warn!(
                consumer = %self.consumer,
                event_id = %event.event_id,
                error = %e,
                "记录已处理事件失败"
            );
            return Err(HandlerError::Retryable(e.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FeedbackCreated;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &EventEnvelope) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::Retryable("db".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> EventEnvelope {
        EventEnvelope::new(
            &FeedbackCreated {
                feedback_id: 9,
                user_id: "u-1".to_string(),
                rating: Some(5),
                created_at: None,
            },
            "feedback-service",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_event_is_skipped() {
        let inner = Arc::new(Counting::default());
        let store = Arc::new(MemoryProcessedEventStore::new());
        let handler = IdempotentHandler::new("point.feedback", inner.clone(), store.clone());

        let event = event();
        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_event_is_not_marked() {
        let inner = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let store = Arc::new(MemoryProcessedEventStore::new());
        let handler = IdempotentHandler::new("point.feedback", inner.clone(), store.clone());

        assert!(handler.handle(&event()).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_consumers_are_tracked_separately() {
        let store = MemoryProcessedEventStore::new();
        store.mark_processed("a", "evt-1").await.unwrap();

        assert!(store.is_processed("a", "evt-1").await.unwrap());
        assert!(!store.is_processed("b", "evt-1").await.unwrap());
    }
}
