//! 积分获取引擎测试
//!
//! 使用内存仓储，时间由测试显式给出。

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use loyalty_shared::http::PaginationParams;
use loyalty_shared::internal_auth::{API_KEY_HEADER, InternalApiKeys};
use loyalty_shared::tier::Tier;
use point_service::{
    PointError, PointService,
    models::UserPoints,
    repository::MemoryPointLedger,
    routes,
    state::AppState,
};
use tower::ServiceExt;

// ==================== 辅助函数 ====================

fn setup() -> (Arc<PointService>, Arc<MemoryPointLedger>) {
    let repo = Arc::new(MemoryPointLedger::new());
    let service = Arc::new(PointService::new(repo.clone()));
    (service, repo)
}

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

// ==================== 每日上限 ====================

#[tokio::test]
async fn test_second_earn_same_day_hits_daily_limit() {
    let (service, repo) = setup();
    let morning = at(2026, 4, 1, 8);

    let award = service
        .process_feedback_point_at("u-1", 1, morning)
        .await
        .unwrap();
    assert_eq!(award.balance.total_points, 1);
    assert_eq!(award.history.points_earned, 1);
    assert!(!award.reset_applied);

    let result = service
        .process_feedback_point_at("u-1", 2, morning + Duration::hours(10))
        .await;
    assert!(matches!(result, Err(PointError::DailyLimitReached { .. })));

    assert_eq!(service.get_balance("u-1").await.unwrap().total_points, 1);
    assert_eq!(repo.history("u-1").len(), 1);
}

#[tokio::test]
async fn test_next_utc_day_can_earn_again() {
    let (service, _) = setup();

    service
        .process_feedback_point_at("u-1", 1, at(2026, 4, 1, 23))
        .await
        .unwrap();
    let award = service
        .process_feedback_point_at("u-1", 2, at(2026, 4, 2, 0))
        .await
        .unwrap();

    assert_eq!(award.balance.total_points, 2);
}

#[tokio::test]
async fn test_same_feedback_is_awarded_once() {
    let (service, _) = setup();

    service
        .process_feedback_point_at("u-1", 7, at(2026, 4, 1, 8))
        .await
        .unwrap();
    let result = service
        .process_feedback_point_at("u-1", 7, at(2026, 4, 5, 8))
        .await;

    assert!(matches!(
        result,
        Err(PointError::AlreadyAwarded { feedback_id: 7, .. })
    ));
    assert_eq!(service.get_balance("u-1").await.unwrap().total_points, 1);
}

#[tokio::test]
async fn test_concurrent_earns_same_day_award_once() {
    let (service, repo) = setup();
    let now = at(2026, 4, 1, 12);

    let mut tasks = Vec::new();
    for feedback_id in 0..10 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .process_feedback_point_at("u-1", feedback_id, now)
                .await
        }));
    }

    let mut earned = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            earned += 1;
        }
    }

    assert_eq!(earned, 1);
    assert_eq!(repo.history("u-1").len(), 1);
}

// ==================== 年度重置 ====================

#[tokio::test]
async fn test_elapsed_reset_zeroes_then_applies_earn() {
    let (service, repo) = setup();
    let mut points = UserPoints::open("u-1", at(2025, 1, 10, 0));
    points.total_points = 120;
    points.last_point_earned_date = Some(at(2025, 12, 31, 9));
    repo.seed(points);

    let now = at(2026, 1, 10, 0) + Duration::minutes(1);
    let award = service
        .process_feedback_point_at("u-1", 1, now)
        .await
        .unwrap();

    assert!(award.reset_applied);
    assert_eq!(award.balance.total_points, 1);
    assert_eq!(award.balance.level, Tier::Bronze);

    let resets = service.resets("u-1").await.unwrap();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].points_before_reset, 120);
    assert_eq!(resets[0].reset_date, now);
    assert_eq!(resets[0].next_reset_date, at(2027, 1, 10, 0) + Duration::minutes(1));
}

#[tokio::test]
async fn test_reset_is_kept_when_daily_limit_hits() {
    let (service, repo) = setup();
    let now = at(2026, 1, 10, 12);
    let mut points = UserPoints::open("u-1", at(2025, 1, 9, 0));
    points.total_points = 80;
    points.last_point_earned_date = Some(now - Duration::hours(2));
    repo.seed(points);

    let result = service.process_feedback_point_at("u-1", 1, now).await;
    assert!(matches!(result, Err(PointError::DailyLimitReached { .. })));

    assert_eq!(service.get_balance("u-1").await.unwrap().total_points, 0);
    assert_eq!(service.resets("u-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reset_not_due_on_exact_boundary() {
    let (service, repo) = setup();
    repo.seed({
        let mut points = UserPoints::open("u-1", at(2025, 6, 1, 0));
        points.total_points = 10;
        points
    });

    let award = service
        .process_feedback_point_at("u-1", 1, at(2026, 6, 1, 0))
        .await
        .unwrap();

    assert!(!award.reset_applied);
    assert_eq!(award.balance.total_points, 11);
}

// ==================== 等级 ====================

#[tokio::test]
async fn test_tier_boundaries() {
    let (service, repo) = setup();
    let cases = [
        (49, Tier::Bronze),
        (50, Tier::Silver),
        (99, Tier::Silver),
        (100, Tier::Gold),
        (199, Tier::Gold),
        (200, Tier::Platinum),
    ];

    for (total, expected) in cases {
        let user_id = format!("u-{total}");
        let mut points = UserPoints::open(user_id.as_str(), Utc::now());
        points.total_points = total;
        repo.seed(points);

        let balance = service.get_balance(&user_id).await.unwrap();
        assert_eq!(balance.level, expected, "total = {total}");
    }
}

#[tokio::test]
async fn test_history_paged_newest_first() {
    let (service, _) = setup();
    for day in 1..=5 {
        service
            .process_feedback_point_at("u-1", day, at(2026, 4, day as u32, 9))
            .await
            .unwrap();
    }

    let page = service
        .history("u-1", &PaginationParams::new(1, 2))
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].source_feedback_id, 5);
    assert_eq!(page.items[1].source_feedback_id, 4);
}

// ==================== HTTP ====================

fn app(service: Arc<PointService>) -> Router {
    Router::new()
        .nest("/api", routes::api_routes(InternalApiKeys::new(["svc-key"])))
        .with_state(AppState::new(service))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_http_balance_requires_api_key() {
    let (service, _) = setup();

    let response = app(service)
        .oneshot(get("/api/users/customer/u-1/points", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_http_balance_with_api_key() {
    let (service, _) = setup();
    service
        .process_feedback_point_at("u-1", 1, at(2026, 4, 1, 9))
        .await
        .unwrap();

    let response = app(service)
        .oneshot(get("/api/users/customer/u-1/points", Some("svc-key")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["totalPoints"], 1);
    assert_eq!(body["data"]["level"], "BRONZE");
    assert_eq!(body["data"]["nextLevel"], "SILVER");
    assert_eq!(body["data"]["pointsToNext"], 49);
}

#[tokio::test]
async fn test_http_unknown_user_balance_is_zero() {
    let (service, _) = setup();

    let response = app(service)
        .oneshot(get("/api/users/customer/nobody/points", Some("svc-key")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["totalPoints"], 0);
}

#[tokio::test]
async fn test_http_history_is_public() {
    let (service, _) = setup();
    service
        .process_feedback_point_at("u-1", 1, at(2026, 4, 1, 9))
        .await
        .unwrap();

    let response = app(service)
        .oneshot(get("/api/users/u-1/points/history?page=1&pageSize=10", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["sourceFeedbackId"], 1);
}
