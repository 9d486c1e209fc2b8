//! 奖励领取服务入口
//!
//! 提供领取与审核 REST API，后台运行 outbox 中继。

use std::sync::Arc;

use axum::{Json, Router, middleware, routing::get};
use loyalty_shared::{
    bus::EventPublisher,
    config::AppConfig,
    database::Database,
    kafka::{KafkaEventPublisher, KafkaProducer},
    observability::{self, middleware as obs_middleware},
    outbox::{OutboxRelay, PgOutbox},
    shutdown::Shutdown,
};
use reward_service::{
    ClaimService, MIGRATOR, SERVICE_NAME, client::HttpPointClient, repository::ClaimRepository,
    routes, state::AppState,
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
        point_service = %config.point_client.base_url,
        "Starting {} on {}",
        SERVICE_NAME,
        config.server_addr()
    );

    let db = Database::connect(&config.database).await?;
    db.run_migrations(&MIGRATOR).await?;
    let producer = KafkaProducer::new(&config.kafka)?;
    let publisher: Arc<dyn EventPublisher> = Arc::new(KafkaEventPublisher::new(producer));

    let shutdown = Shutdown::new();

    let points = HttpPointClient::new(
        &config.point_client,
        config.internal_auth.outbound_api_key.clone(),
    )?;
    let store = Arc::new(ClaimRepository::new(db.pool().clone()));
    let claims = Arc::new(ClaimService::new(store, Arc::new(points)));

    let relay = OutboxRelay::new(
        Arc::new(PgOutbox::new(db.pool().clone())),
        publisher,
        config.outbox.clone(),
    );
    let relay_task = tokio::spawn(relay.run(shutdown.subscribe()));

    let app = Router::new()
        .nest("/api", routes::api_routes())
        .route("/health", get(health_check))
        .route(
            "/ready",
            get({
                let db = db.clone();
                move || readiness_check(db.clone())
            }),
        )
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(AppState::new(claims));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().listen_for_signal())
        .await?;

    shutdown.trigger();
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

/// 就绪探针
async fn readiness_check(db: Database) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    let db_ok = db.health_check().await.is_ok();
    let status = if db_ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if db_ok { "ready" } else { "not_ready" },
            "database": db_ok
        })),
    )
}
