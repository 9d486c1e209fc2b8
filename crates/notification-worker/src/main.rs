//! 通知工作者入口
//!
//! 每条通知队列一个 Kafka 消费循环，另运行死信重放消费者和健康检查端点。

use std::sync::Arc;

use axum::{Json, Router, routing::get};
use loyalty_shared::{
    bus::EventHandler,
    cache::Cache,
    config::AppConfig,
    dlq::{DlqConsumer, DlqProducer},
    idempotency::{IdempotentHandler, ProcessedEventStore, RedisProcessedEventStore},
    kafka::{KafkaProducer, KafkaQueueConsumer},
    observability,
    shutdown::Shutdown,
};
use notification_worker::{
    SERVICE_NAME,
    consumer::{NotificationHandler, default_senders, queue_bindings},
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.observability_config()).await?;

    info!(environment = %config.environment, "Starting {}...", SERVICE_NAME);

    let cache = Cache::new(&config.redis)?;
    let producer = KafkaProducer::new(&config.kafka)?;
    let shutdown = Shutdown::new();

    let handler = Arc::new(NotificationHandler::new(default_senders()));
    let processed: Arc<dyn ProcessedEventStore> = Arc::new(
        RedisProcessedEventStore::new(cache.clone())
            .with_ttl(config.consumer.processed_event_ttl()),
    );
    let retry_policy = config.consumer.retry_policy();

    let mut tasks = Vec::new();
    for binding in queue_bindings() {
        let queue = binding.queue.clone();
        let idempotent: Arc<dyn EventHandler> = Arc::new(IdempotentHandler::new(
            queue.clone(),
            handler.clone(),
            processed.clone(),
        ));
        let dead_letter = config.consumer.dead_letter_enabled.then(|| {
            DlqProducer::new(producer.clone(), SERVICE_NAME, retry_policy.clone())
        });

        let consumer = KafkaQueueConsumer::new(&config.kafka, binding)?;
        info!(queue = %queue, "通知队列消费者已启动");
        tasks.push(tokio::spawn(consumer.run(
            idempotent,
            retry_policy.clone(),
            dead_letter,
            shutdown.subscribe(),
        )));
    }

    // 全局唯一的死信重放
    if config.consumer.dead_letter_enabled {
        let dlq_producer = DlqProducer::new(producer.clone(), SERVICE_NAME, retry_policy.clone());
        let dlq_consumer = DlqConsumer::new(&config.kafka, dlq_producer)?;
        tasks.push(tokio::spawn(dlq_consumer.run(shutdown.subscribe())));
    }

    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/ready",
            get({
                let cache = cache.clone();
                move || readiness_check(cache.clone())
            }),
        );

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().listen_for_signal())
        .await?;

    shutdown.trigger();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "消费者任务异常退出");
        }
    }

    info!("Notification worker shutdown complete");
    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME
    }))
}

/// 就绪探针：幂等记录依赖 Redis
async fn readiness_check(cache: Cache) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    let redis_ok = cache.health_check().await.is_ok();
    let status = if redis_ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if redis_ok { "ready" } else { "not_ready" },
            "redis": redis_ok
        })),
    )
}
