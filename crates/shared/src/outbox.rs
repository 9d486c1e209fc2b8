//! 事务性 outbox
//!
//! 业务写入与待发布事件在同一个数据库事务中提交，由后台中继按插入顺序
//! 投递到总线。发布成功后才标记已发布，因此事件不会因进程崩溃丢失，
//! 但可能重复投递，消费端负责幂等。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::EventPublisher;
use crate::config::OutboxConfig;
use crate::error::{LoyaltyError, Result};
use crate::events::EventEnvelope;
use crate::observability::metrics;

/// outbox 表中的一行
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub event_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub aggregate_id: String,
    pub envelope: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn envelope(&self) -> Result<EventEnvelope> {
        Ok(serde_json::from_value(self.envelope.clone())?)
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// 一次中继的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    /// 首个发布失败的原因，失败后本批次剩余事件留待下次
    pub failed: Option<String>,
}

/// outbox 存储
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 按插入顺序发布最多 `limit` 条未发布事件，遇到失败即停止
    async fn relay_batch(&self, limit: i64, publisher: &dyn EventPublisher) -> Result<RelayReport>;

    async fn pending_count(&self) -> Result<i64>;
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

/// PostgreSQL outbox，表结构见各服务的 `outbox_events` 迁移
#[derive(Clone)]
pub struct PgOutbox {
    pool: PgPool,
}

impl PgOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在调用方的事务中写入待发布事件
    pub async fn enqueue_in_tx(conn: &mut PgConnection, envelope: &EventEnvelope) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox_events (event_id, exchange, routing_key, aggregate_id, envelope)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&envelope.event_id)
        .bind(&envelope.exchange)
        .bind(&envelope.routing_key)
        .bind(&envelope.aggregate_id)
        .bind(serde_json::to_value(envelope)?)
        .fetch_one(&mut *conn)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for PgOutbox {
    #[instrument(skip(self, publisher))]
    async fn relay_batch(&self, limit: i64, publisher: &dyn EventPublisher) -> Result<RelayReport> {
        let mut tx = self.pool.begin().await?;

        // SKIP LOCKED 允许多个实例并行中继而不重复取到同一行
        let records = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, event_id, exchange, routing_key, aggregate_id, envelope,
                   attempts, last_error, created_at, published_at
            FROM outbox_events
            WHERE published_at IS NULL
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut report = RelayReport::default();

        for record in records {
            let outcome = match record.envelope() {
                Ok(envelope) => publisher.publish(&envelope).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    sqlx::query("UPDATE outbox_events SET published_at = NOW() WHERE id = $1")
                        .bind(record.id)
                        .execute(&mut *tx)
                        .await?;
                    report.published += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    sqlx::query(
                        "UPDATE outbox_events SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
                    )
                    .bind(record.id)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                    report.failed = Some(message);
                    break;
                }
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE published_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

/// 内存 outbox，配合内存仓储使用
#[derive(Default)]
pub struct MemoryOutbox {
    records: Mutex<Vec<OutboxRecord>>,
    next_id: AtomicI64,
    relay_lock: tokio::sync::Mutex<()>,
    unavailable: AtomicBool,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, envelope: &EventEnvelope) -> Result<()> {
        self.enqueue_all(std::slice::from_ref(envelope))
    }

    /// 全部写入或全部不写，对应同一事务内的多条 outbox 行
    pub fn enqueue_all(&self, envelopes: &[EventEnvelope]) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LoyaltyError::EventBus("outbox 不可写".to_string()));
        }

        let payloads = envelopes
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut records = self.records.lock();
        for (envelope, payload) in envelopes.iter().zip(payloads) {
            records.push(OutboxRecord {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                event_id: envelope.event_id.clone(),
                exchange: envelope.exchange.clone(),
                routing_key: envelope.routing_key.clone(),
                aggregate_id: envelope.aggregate_id.clone(),
                envelope: payload,
                attempts: 0,
                last_error: None,
                created_at: Utc::now(),
                published_at: None,
            });
        }
        Ok(())
    }

    /// 模拟 outbox 写入失败，内存仓储应当整体放弃本次变更
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        self.records.lock().clone()
    }

    /// 未发布的事件信封
    pub fn pending(&self) -> Vec<EventEnvelope> {
        self.records
            .lock()
            .iter()
            .filter(|r| !r.is_published())
            .filter_map(|r| r.envelope().ok())
            .collect()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn relay_batch(&self, limit: i64, publisher: &dyn EventPublisher) -> Result<RelayReport> {
        let _guard = self.relay_lock.lock().await;

        let batch: Vec<OutboxRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| !r.is_published())
            .take(limit.max(0) as usize)
            .cloned()
            .collect();

        let mut report = RelayReport::default();

        for record in batch {
            let outcome = match record.envelope() {
                Ok(envelope) => publisher.publish(&envelope).await,
                Err(e) => Err(e),
            };

            let mut records = self.records.lock();
            let Some(stored) = records.iter_mut().find(|r| r.id == record.id) else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    stored.published_at = Some(Utc::now());
                    report.published += 1;
                }
                Err(e) => {
                    stored.attempts += 1;
                    stored.last_error = Some(e.to_string());
                    report.failed = Some(e.to_string());
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn pending_count(&self) -> Result<i64> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| !r.is_published())
            .count() as i64)
    }
}

// ---------------------------------------------------------------------------
// 中继
// ---------------------------------------------------------------------------

/// outbox 中继
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// 发布积压事件直到清空或遇到失败，返回发布条数
    pub async fn relay_once(&self) -> Result<usize> {
        let mut total = 0;

        loop {
            let report = self
                .store
                .relay_batch(self.config.batch_size, self.publisher.as_ref())
                .await?;
            total += report.published;

            if let Some(reason) = report.failed {
                warn!(published = total, error = %reason, "outbox 发布失败，稍后重试");
                break;
            }
            if (report.published as i64) < self.config.batch_size {
                break;
            }
        }

        if total > 0 {
            debug!(published = total, "outbox 事件已发布");
        }
        if let Ok(pending) = self.store.pending_count().await {
            metrics::set_outbox_pending(pending);
        }

        Ok(total)
    }

    /// 按轮询间隔持续中继，直到收到关闭信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "outbox 中继已启动"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval());

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.relay_once().await {
                        error!(error = %e, "outbox 中继失败");
                    }
                }
            }
        }

        // 退出前尽量把已提交的事件发出去
        if let Err(e) = self.relay_once().await {
            error!(error = %e, "关闭前的 outbox 中继失败");
        }
        info!("outbox 中继已退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, QueueBinding};
    use crate::error::LoyaltyError;
    use crate::events::RewardClaimed;
    use std::sync::atomic::AtomicU32;

    fn claimed(claim_id: i64) -> EventEnvelope {
        EventEnvelope::new(
            &RewardClaimed {
                claim_id,
                user_id: "u".to_string(),
                reward_id: 1,
                points: 50,
                created_at: Utc::now(),
            },
            "reward-service",
        )
        .unwrap()
    }

    /// 前 N 次发布失败
    struct FlakyPublisher {
        failures: AtomicU32,
        inner: InMemoryBus,
    }

    #[async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LoyaltyError::Kafka("broker unavailable".to_string()));
            }
            self.inner.publish(envelope).await
        }
    }

    fn config(batch_size: i64) -> OutboxConfig {
        OutboxConfig {
            poll_interval_ms: 10,
            batch_size,
        }
    }

    #[tokio::test]
    async fn test_relay_publishes_in_order() {
        let bus = InMemoryBus::new();
        bus.declare_queue(QueueBinding::new("q", "reward.events").bind("reward.claimed"));

        let outbox = Arc::new(MemoryOutbox::new());
        for id in 1..=5 {
            outbox.enqueue(&claimed(id)).unwrap();
        }

        let relay = OutboxRelay::new(outbox.clone(), Arc::new(bus.clone()), config(2));
        assert_eq!(relay.relay_once().await.unwrap(), 5);
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
        assert_eq!(bus.queue_depth("q"), 5);
    }

    #[tokio::test]
    async fn test_failure_stops_batch_and_keeps_order() {
        let bus = InMemoryBus::new();
        bus.declare_queue(QueueBinding::new("q", "reward.events").bind("reward.claimed"));
        let publisher = Arc::new(FlakyPublisher {
            failures: AtomicU32::new(1),
            inner: bus.clone(),
        });

        let outbox = Arc::new(MemoryOutbox::new());
        outbox.enqueue(&claimed(1)).unwrap();
        outbox.enqueue(&claimed(2)).unwrap();

        let report = outbox.relay_batch(10, publisher.as_ref()).await.unwrap();
        assert_eq!(report.published, 0);
        assert!(report.failed.is_some());

        let records = outbox.records();
        assert_eq!(records[0].attempts, 1);
        assert!(records[0].last_error.is_some());
        assert_eq!(records[1].attempts, 0);

        let report = outbox.relay_batch(10, publisher.as_ref()).await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(bus.queue_depth("q"), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_after_final_flush() {
        let bus = InMemoryBus::new();
        bus.declare_queue(QueueBinding::new("q", "reward.events").bind("reward.claimed"));
        let outbox = Arc::new(MemoryOutbox::new());
        outbox.enqueue(&claimed(1)).unwrap();

        let relay = OutboxRelay::new(outbox.clone(), Arc::new(bus.clone()), config(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outbox.pending_count().await.unwrap(), 0);
        assert_eq!(bus.queue_depth("q"), 1);
    }
}
