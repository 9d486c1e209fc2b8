//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 收集与导出指标。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 安装 Prometheus recorder 并启动 `/metrics` 服务器
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

fn describe_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!("claims_total", "Reward claim attempts by outcome");
    metrics::describe_counter!(
        "claim_transitions_total",
        "Claim status transitions by source and target status"
    );

    metrics::describe_counter!("stock_mutations_total", "Stock ledger mutations");
    metrics::describe_counter!("low_stock_alerts_total", "Low stock alerts raised");

    metrics::describe_counter!("point_accruals_total", "Feedback point accruals by outcome");
    metrics::describe_counter!("point_resets_total", "Annual point resets applied");

    metrics::describe_counter!("events_published_total", "Events published to the bus");
    metrics::describe_counter!("events_consumed_total", "Events consumed from queues");
    metrics::describe_counter!(
        "events_dead_lettered_total",
        "Events moved to the dead letter queue"
    );
    metrics::describe_gauge!("outbox_pending", "Outbox rows waiting to be relayed");
    metrics::describe_counter!("notifications_sent_total", "Notifications sent by channel");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录领取结果（success / insufficient_points / out_of_stock / ...）
#[inline]
pub fn record_claim(outcome: &str) {
    metrics::counter!("claims_total", "outcome" => outcome.to_string()).increment(1);
}

#[inline]
pub fn record_claim_transition(from: &str, to: &str) {
    metrics::counter!(
        "claim_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_stock_mutation(change_type: &str, outcome: &str) {
    metrics::counter!(
        "stock_mutations_total",
        "type" => change_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_low_stock_alert() {
    metrics::counter!("low_stock_alerts_total").increment(1);
}

#[inline]
pub fn record_point_accrual(outcome: &str) {
    metrics::counter!("point_accruals_total", "outcome" => outcome.to_string()).increment(1);
}

#[inline]
pub fn record_point_reset() {
    metrics::counter!("point_resets_total").increment(1);
}

#[inline]
pub fn record_event_published(exchange: &str, routing_key: &str, outcome: &str) {
    metrics::counter!(
        "events_published_total",
        "exchange" => exchange.to_string(),
        "routing_key" => routing_key.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_event_consumed(queue: &str, routing_key: &str, outcome: &str) {
    metrics::counter!(
        "events_consumed_total",
        "queue" => queue.to_string(),
        "routing_key" => routing_key.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_event_dead_lettered(queue: &str) {
    metrics::counter!("events_dead_lettered_total", "queue" => queue.to_string()).increment(1);
}

#[inline]
pub fn set_outbox_pending(pending: i64) {
    metrics::gauge!("outbox_pending").set(pending as f64);
}

#[inline]
pub fn record_notification_sent(channel: &str, outcome: &str) {
    metrics::counter!(
        "notifications_sent_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
