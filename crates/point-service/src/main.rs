//! 积分服务入口
//!
//! 提供积分查询 REST API，后台运行反馈事件消费者。

use std::sync::Arc;

use axum::{Json, Router, middleware, routing::get};
use loyalty_shared::{
    cache::Cache,
    config::AppConfig,
    database::Database,
    dlq::DlqProducer,
    idempotency::{IdempotentHandler, RedisProcessedEventStore},
    internal_auth::InternalApiKeys,
    kafka::{KafkaProducer, KafkaQueueConsumer},
    observability::{self, middleware as obs_middleware},
    shutdown::Shutdown,
};
use point_service::{
    MIGRATOR, PointService, SERVICE_NAME,
    consumer::{FEEDBACK_QUEUE, FeedbackPointHandler, feedback_binding},
    repository::PointsRepository,
    routes,
    state::AppState,
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

    let db = Database::connect(&config.database).await?;
    db.run_migrations(&MIGRATOR).await?;
    let cache = Cache::new(&config.redis)?;

    let api_keys = InternalApiKeys::from_config(&config.internal_auth);
    if api_keys.is_open() {
        warn!("未配置内部 API Key，余额接口不做鉴权");
    }

    let shutdown = Shutdown::new();

    let repo = Arc::new(PointsRepository::new(db.pool().clone()));
    let points = Arc::new(PointService::new(repo));

    // 反馈事件消费者
    let handler = IdempotentHandler::new(
        FEEDBACK_QUEUE,
        FeedbackPointHandler::new(points.clone()),
        Arc::new(
            RedisProcessedEventStore::new(cache.clone())
                .with_ttl(config.consumer.processed_event_ttl()),
        ),
    );
    let dead_letter = if config.consumer.dead_letter_enabled {
        let producer = KafkaProducer::new(&config.kafka)?;
        Some(DlqProducer::new(
            producer,
            SERVICE_NAME,
            config.consumer.retry_policy(),
        ))
    } else {
        None
    };
    let consumer = KafkaQueueConsumer::new(&config.kafka, feedback_binding())?;
    let consumer_task = tokio::spawn(consumer.run(
        Arc::new(handler),
        config.consumer.retry_policy(),
        dead_letter,
        shutdown.subscribe(),
    ));

    let app = Router::new()
        .nest("/api", routes::api_routes(api_keys))
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
        .with_state(AppState::new(points));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().listen_for_signal())
        .await?;

    shutdown.trigger();
    if let Err(e) = consumer_task.await {
        warn!(error = %e, "反馈事件消费者异常退出");
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
