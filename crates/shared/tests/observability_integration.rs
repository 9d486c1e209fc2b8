//! 可观测性模块集成测试
//!
//! 测试 metrics、tracing 和 middleware 模块的核心功能。

use std::collections::HashMap;

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use loyalty_shared::observability::metrics::{
        record_claim, record_claim_transition, record_event_consumed, record_event_dead_lettered,
        record_event_published, record_http_request, record_low_stock_alert,
        record_notification_sent, record_point_accrual, record_point_reset,
        record_stock_mutation, set_outbox_pending,
    };

    #[test]
    fn test_record_http_request() {
        record_http_request("GET", "/api/users/{id}/points/history", 200, 0.05);
        record_http_request("POST", "/api/claims", 201, 0.12);
        record_http_request("PUT", "/api/claims/{id}/status", 400, 0.08);
        record_http_request("GET", "/api/users/customer/{id}/points", 401, 0.01);
        record_http_request("POST", "/api/claims", 502, 3.0);
    }

    #[test]
    fn test_record_domain_outcomes() {
        record_claim("success");
        record_claim("INSUFFICIENT_POINTS");
        record_claim_transition("PENDING", "APPROVED");
        record_claim_transition("APPROVED", "CANCELLED");
        record_stock_mutation("DECREASE", "ok");
        record_stock_mutation("DECREASE", "INSUFFICIENT_STOCK");
        record_low_stock_alert();
        record_point_accrual("earned");
        record_point_accrual("daily_limit");
        record_point_reset();
    }

    #[test]
    fn test_record_bus_metrics() {
        record_event_published("reward.events", "reward.claimed", "ok");
        record_event_consumed("inventory.reward-claims", "reward.claimed", "ack");
        record_event_consumed("notification.reward", "reward.claimed", "requeue");
        record_event_dead_lettered("notification.article");
        record_notification_sent("EMAIL", "failed");
    }

    #[test]
    fn test_metrics_with_edge_cases() {
        set_outbox_pending(0);
        set_outbox_pending(i64::MAX);
        record_http_request("", "", 0, 0.0);
        record_event_consumed("", "", "");
    }
}

// ============================================================================
// 追踪上下文传播测试
// ============================================================================

mod tracing_tests {
    use super::*;
    use loyalty_shared::observability::tracing::{
        current_trace_id, extract_from_headers, inject_to_headers, set_parent_from_headers,
    };
    use opentelemetry::trace::TraceContextExt;

    #[test]
    fn test_extract_with_tracestate() {
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        headers.insert("tracestate".to_string(), "congo=t61rcWkgMzE".to_string());

        let context = extract_from_headers(&headers);
        let span_context = context.span().span_context().clone();

        assert!(span_context.is_valid());
        assert_eq!(
            span_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
    }

    #[test]
    fn test_extract_from_malformed_traceparent() {
        let test_cases = vec![
            "",
            "00",
            "00-0af7651916cd43dd8448eb211c80319c",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331",
            "00-invalid-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-invalid-01",
        ];

        for invalid in test_cases {
            let mut headers = HashMap::new();
            headers.insert("traceparent".to_string(), invalid.to_string());
            let context = extract_from_headers(&headers);
            assert!(!context.span().span_context().is_valid(), "{invalid}");
        }
    }

    #[test]
    fn test_set_parent_without_subscriber() {
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );

        set_parent_from_headers(&headers);
        assert!(current_trace_id().is_none());
    }

    #[test]
    fn test_inject_without_context_is_noop() {
        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), "k".to_string());

        inject_to_headers(&mut headers);
        assert_eq!(headers.len(), 1);
    }
}

// ============================================================================
// 中间件测试
// ============================================================================

mod middleware_tests {
    use axum::{Router, body::Body, http::Request, middleware, routing::get};
    use loyalty_shared::observability::middleware::{RequestId, http_tracing, request_id};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/ping",
                get(|axum::Extension(id): axum::Extension<RequestId>| async move {
                    id.as_str().to_string()
                }),
            )
            .layer(middleware::from_fn(http_tracing))
            .layer(middleware::from_fn(request_id))
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let response = app()
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert!(!id.is_empty());
    }
}

// ============================================================================
// 配置与 Guard
// ============================================================================

mod config_tests {
    use loyalty_shared::observability::{ObservabilityConfig, ObservabilityGuard};

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.service_name, "unknown-service");
        assert_eq!(config.metrics_port, 9090);
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_empty_guard_drop() {
        for _ in 0..3 {
            let guard = ObservabilityGuard::empty();
            drop(guard);
        }
    }
}
