//! 库存服务入口
//!
//! 提供库存管理 REST API，后台运行 outbox 中继和领取事件消费者。

use std::sync::Arc;

use axum::{Json, Router, middleware, routing::get};
use inventory_service::{
    MIGRATOR, SERVICE_NAME, StockLedgerService,
    consumer::{REWARD_CLAIMS_QUEUE, RewardClaimHandler, reward_claims_binding},
    repository::ItemRepository,
    routes,
    state::AppState,
};
use loyalty_shared::{
    bus::EventPublisher,
    cache::Cache,
    config::AppConfig,
    database::Database,
    dlq::DlqProducer,
    idempotency::{IdempotentHandler, RedisProcessedEventStore},
    kafka::{KafkaEventPublisher, KafkaProducer, KafkaQueueConsumer},
    observability::{self, middleware as obs_middleware},
    outbox::{OutboxRelay, PgOutbox},
    shutdown::Shutdown,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.observability_config()).await?;

    info!(
        environment = %config.environment,
        "Starting {} on {}",
        SERVICE_NAME,
        config.server_addr()
    );

    // 基础设施
    let db = Database::connect(&config.database).await?;
    db.run_migrations(&MIGRATOR).await?;
    let cache = Cache::new(&config.redis)?;
    let producer = KafkaProducer::new(&config.kafka)?;
    let publisher: Arc<dyn EventPublisher> = Arc::new(KafkaEventPublisher::new(producer.clone()));

    let shutdown = Shutdown::new();

    // 领域服务
    let repo = Arc::new(ItemRepository::new(db.pool().clone()));
    let ledger = Arc::new(StockLedgerService::new(repo));

    // outbox 中继
    let relay = OutboxRelay::new(
        Arc::new(PgOutbox::new(db.pool().clone())),
        publisher,
        config.outbox.clone(),
    );
    let relay_task = tokio::spawn(relay.run(shutdown.subscribe()));

    // 领取事件消费者
    let handler = IdempotentHandler::new(
        REWARD_CLAIMS_QUEUE,
        RewardClaimHandler::new(ledger.clone()),
        Arc::new(
            RedisProcessedEventStore::new(cache.clone())
                .with_ttl(config.consumer.processed_event_ttl()),
        ),
    );
    let dead_letter = config.consumer.dead_letter_enabled.then(|| {
        DlqProducer::new(producer.clone(), SERVICE_NAME, config.consumer.retry_policy())
    });
    let consumer = KafkaQueueConsumer::new(&config.kafka, reward_claims_binding())?;
    let consumer_task = tokio::spawn(consumer.run(
        Arc::new(handler),
        config.consumer.retry_policy(),
        dead_letter,
        shutdown.subscribe(),
    ));

    let app = Router::new()
        .nest("/api", routes::api_routes())
        .route("/health", get(health_check))
        .route(
            "/ready",
            get({
                let db = db.clone();
                let cache = cache.clone();
                move || readiness_check(db.clone(), cache.clone())
            }),
        )
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(AppState::new(ledger));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().listen_for_signal())
        .await?;

    // 通知后台任务退出，中继会在退出前做最后一次投递
    shutdown.trigger();
    if let Err(e) = consumer_task.await {
        warn!(error = %e, "领取事件消费者异常退出");
    }
    if let Err(e) = relay_task.await {
        warn!(error = %e, "outbox 中继异常退出");
    }

    db.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// 存活探针
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME
    }))
}

/// 就绪探针：数据库和 Redis 均可用
async fn readiness_check(
    db: Database,
    cache: Cache,
) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    let db_ok = db.health_check().await.is_ok();
    let redis_ok = cache.health_check().await.is_ok();
    let status = if db_ok && redis_ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if status.is_success() { "ready" } else { "not_ready" },
            "database": db_ok,
            "redis": redis_ok
        })),
    )
}
