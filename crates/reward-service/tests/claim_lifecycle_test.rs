//! 领取生命周期测试
//!
//! 使用内存存储、内存 outbox 和固定余额的积分客户端。

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use loyalty_shared::events::{ClaimStatusUpdated, RewardClaimed};
use loyalty_shared::http::PaginationParams;
use loyalty_shared::outbox::MemoryOutbox;
use reward_service::{
    ClaimError, ClaimService,
    client::StaticPointClient,
    models::{ClaimRewardRequest, ClaimStatus, NewReward, UpdateClaimStatusRequest},
    repository::MemoryClaimStore,
    routes,
    state::AppState,
};
use tower::ServiceExt;

// ==================== 辅助函数 ====================

struct Fixture {
    service: Arc<ClaimService>,
    store: Arc<MemoryClaimStore>,
    points: Arc<StaticPointClient>,
}

fn setup() -> Fixture {
    let store = Arc::new(MemoryClaimStore::new(Arc::new(MemoryOutbox::new())));
    let points = Arc::new(StaticPointClient::new());
    let service = Arc::new(ClaimService::new(store.clone(), points.clone()));
    Fixture {
        service,
        store,
        points,
    }
}

async fn reward(f: &Fixture, point_cost: i64, stock: i32) -> i64 {
    f.service
        .create_reward(NewReward {
            name: format!("Reward {point_cost}"),
            description: None,
            point_cost,
            stock,
        })
        .await
        .unwrap()
        .id
}

fn claim(user_id: &str, reward_id: i64) -> ClaimRewardRequest {
    ClaimRewardRequest {
        user_id: user_id.to_string(),
        reward_id,
    }
}

fn to(status: ClaimStatus) -> UpdateClaimStatusRequest {
    UpdateClaimStatusRequest {
        status,
        notes: Some("审核".to_string()),
    }
}

// ==================== 领取 ====================

#[tokio::test]
async fn test_last_unit_then_insufficient_stock() {
    let f = setup();
    let reward_id = reward(&f, 150, 1).await;
    f.points.set_balance("u-1", 150);
    f.points.set_balance("u-2", 500);

    let created = f.service.claim_reward(claim("u-1", reward_id)).await.unwrap();
    assert_eq!(created.status, ClaimStatus::Pending);
    assert_eq!(created.point_cost, 150);
    assert_eq!(f.service.get_reward(reward_id).await.unwrap().stock, 0);

    let err = f
        .service
        .claim_reward(claim("u-2", reward_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::InsufficientStock { .. }));
}

#[tokio::test]
async fn test_claim_publishes_reward_claimed_through_outbox() {
    let f = setup();
    let reward_id = reward(&f, 60, 5).await;
    f.points.set_balance("u-1", 60);

    let created = f.service.claim_reward(claim("u-1", reward_id)).await.unwrap();

    let pending = f.store.outbox().pending();
    assert_eq!(pending.len(), 1);
    let event: RewardClaimed = pending[0].decode().unwrap();
    assert_eq!(event.claim_id, created.id);
    assert_eq!(event.points, 60);
    assert_eq!(event.user_id, "u-1");
}

#[tokio::test]
async fn test_one_claim_per_tier_per_user() {
    let f = setup();
    let gold_a = reward(&f, 100, 5).await;
    let gold_b = reward(&f, 199, 5).await;
    let platinum = reward(&f, 200, 5).await;
    f.points.set_balance("u-1", 1_000);

    f.service.claim_reward(claim("u-1", gold_a)).await.unwrap();

    let err = f
        .service
        .claim_reward(claim("u-1", gold_b))
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::TierAlreadyClaimed { .. }));

    f.service.claim_reward(claim("u-1", platinum)).await.unwrap();
    assert_eq!(f.service.list_user_claims("u-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_path_alias_user_id_cannot_claim_same_tier_again() {
    let f = setup();
    let gold_a = reward(&f, 100, 5).await;
    let gold_b = reward(&f, 150, 5).await;
    f.points.set_balance("bob", 500);
    f.points.set_balance("bob/.", 500);

    f.service.claim_reward(claim("bob", gold_a)).await.unwrap();

    for alias in ["bob/.", "alice/../bob"] {
        let err = f
            .service
            .claim_reward(claim(alias, gold_b))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::Validation(_)));
    }
    assert_eq!(f.service.get_reward(gold_b).await.unwrap().stock, 5);
    assert_eq!(f.store.outbox().pending().len(), 1);
}

#[tokio::test]
async fn test_rejected_claim_still_holds_tier() {
    let f = setup();
    let first = reward(&f, 50, 5).await;
    let second = reward(&f, 80, 5).await;
    f.points.set_balance("u-1", 100);

    let created = f.service.claim_reward(claim("u-1", first)).await.unwrap();
    f.service
        .update_claim_status(created.id, to(ClaimStatus::Rejected))
        .await
        .unwrap();

    let err = f
        .service
        .claim_reward(claim("u-1", second))
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::TierAlreadyClaimed { .. }));
}

#[tokio::test]
async fn test_point_service_down_creates_nothing() {
    let f = setup();
    let reward_id = reward(&f, 50, 5).await;
    f.points.set_unavailable(true);

    let err = f
        .service
        .claim_reward(claim("u-1", reward_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::Upstream { .. }));
    assert_eq!(f.service.get_reward(reward_id).await.unwrap().stock, 5);
    assert!(f.store.outbox().pending().is_empty());
}

#[tokio::test]
async fn test_outbox_failure_rolls_back_claim_and_transition() {
    let f = setup();
    let reward_id = reward(&f, 50, 5).await;
    f.points.set_balance("u-1", 100);

    f.store.outbox().set_unavailable(true);
    let err = f
        .service
        .claim_reward(claim("u-1", reward_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::Infrastructure(_)));
    assert_eq!(f.service.get_reward(reward_id).await.unwrap().stock, 5);
    assert!(f.service.list_user_claims("u-1").await.unwrap().is_empty());

    f.store.outbox().set_unavailable(false);
    let created = f.service.claim_reward(claim("u-1", reward_id)).await.unwrap();

    f.store.outbox().set_unavailable(true);
    assert!(
        f.service
            .update_claim_status(created.id, to(ClaimStatus::Cancelled))
            .await
            .is_err()
    );
    assert_eq!(
        f.service.get_claim(created.id).await.unwrap().status,
        ClaimStatus::Pending
    );
    assert_eq!(f.service.get_reward(reward_id).await.unwrap().stock, 4);
}

#[tokio::test]
async fn test_concurrent_claims_never_oversell_reward() {
    let f = setup();
    let reward_id = reward(&f, 50, 3).await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let user_id = format!("u-{i}");
        f.points.set_balance(&user_id, 100);
        let service = f.service.clone();
        tasks.push(tokio::spawn(async move {
            service.claim_reward(claim(&user_id, reward_id)).await
        }));
    }

    let mut ok = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    assert_eq!(ok, 3);
    assert_eq!(f.service.get_reward(reward_id).await.unwrap().stock, 0);
}

#[tokio::test]
async fn test_inactive_reward_is_not_claimable() {
    let f = setup();
    let reward_id = reward(&f, 50, 3).await;
    f.store.set_active(reward_id, false);
    f.points.set_balance("u-1", 100);

    let err = f
        .service
        .claim_reward(claim("u-1", reward_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::RewardNotFound(_)));
}

// ==================== 状态机 ====================

#[tokio::test]
async fn test_approved_then_cancelled_restores_stock() {
    let f = setup();
    let reward_id = reward(&f, 150, 1).await;
    f.points.set_balance("u-1", 150);
    let created = f.service.claim_reward(claim("u-1", reward_id)).await.unwrap();

    f.service
        .update_claim_status(created.id, to(ClaimStatus::Approved))
        .await
        .unwrap();
    assert_eq!(f.service.get_reward(reward_id).await.unwrap().stock, 0);

    let cancelled = f
        .service
        .update_claim_status(created.id, to(ClaimStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ClaimStatus::Cancelled);
    assert_eq!(f.service.get_reward(reward_id).await.unwrap().stock, 1);

    let last = f.store.outbox().pending().pop().unwrap();
    let event: ClaimStatusUpdated = last.decode().unwrap();
    assert_eq!(event.status, "CANCELLED");
}

#[tokio::test]
async fn test_terminal_status_rejects_any_transition() {
    let f = setup();
    let reward_id = reward(&f, 50, 2).await;
    f.points.set_balance("u-1", 50);
    let created = f.service.claim_reward(claim("u-1", reward_id)).await.unwrap();

    f.service
        .update_claim_status(created.id, to(ClaimStatus::Rejected))
        .await
        .unwrap();
    let stock_after_reject = f.service.get_reward(reward_id).await.unwrap().stock;
    let events_after_reject = f.store.outbox().pending().len();

    for next in [
        ClaimStatus::Pending,
        ClaimStatus::Approved,
        ClaimStatus::Rejected,
        ClaimStatus::Cancelled,
    ] {
        let err = f
            .service
            .update_claim_status(created.id, to(next))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::InvalidClaimStatus { .. }));
    }

    let claim = f.service.get_claim(created.id).await.unwrap();
    assert_eq!(claim.status, ClaimStatus::Rejected);
    assert_eq!(
        f.service.get_reward(reward_id).await.unwrap().stock,
        stock_after_reject
    );
    assert_eq!(f.store.outbox().pending().len(), events_after_reject);
}

#[tokio::test]
async fn test_list_by_status_is_paged() {
    let f = setup();
    let tiers = [50, 100, 200];
    for (i, cost) in tiers.iter().enumerate() {
        let reward_id = reward(&f, *cost, 5).await;
        f.points.set_balance("u-1", 1_000);
        let created = f.service.claim_reward(claim("u-1", reward_id)).await.unwrap();
        if i == 0 {
            f.service
                .update_claim_status(created.id, to(ClaimStatus::Approved))
                .await
                .unwrap();
        }
    }

    let pending = f
        .service
        .list_claims_by_status(ClaimStatus::Pending, &PaginationParams::new(1, 1))
        .await
        .unwrap();
    assert_eq!(pending.total, 2);
    assert_eq!(pending.items.len(), 1);

    let all = f
        .service
        .list_claims(&PaginationParams::default())
        .await
        .unwrap();
    assert_eq!(all.total, 3);
    assert!(all.items[0].id > all.items[2].id);
}

// ==================== HTTP ====================

fn app(service: Arc<ClaimService>) -> Router {
    Router::new()
        .nest("/api", routes::api_routes())
        .with_state(AppState::new(service))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_http_claim_insufficient_points_is_400() {
    let f = setup();
    let reward_id = reward(&f, 150, 1).await;
    f.points.set_balance("u-1", 10);

    let response = app(f.service.clone())
        .oneshot(json_request(
            "POST",
            "/api/claims",
            serde_json::json!({ "userId": "u-1", "rewardId": reward_id }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INSUFFICIENT_POINTS");
}

#[tokio::test]
async fn test_http_upstream_failure_is_502() {
    let f = setup();
    let reward_id = reward(&f, 50, 1).await;
    f.points.set_unavailable(true);

    let response = app(f.service.clone())
        .oneshot(json_request(
            "POST",
            "/api/claims",
            serde_json::json!({ "userId": "u-1", "rewardId": reward_id }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_http_status_update_flow() {
    let f = setup();
    let reward_id = reward(&f, 50, 1).await;
    f.points.set_balance("u-1", 50);
    let created = f.service.claim_reward(claim("u-1", reward_id)).await.unwrap();

    let response = app(f.service.clone())
        .oneshot(json_request(
            "PUT",
            &format!("/api/claims/{}/status", created.id),
            serde_json::json!({ "status": "APPROVED", "notes": "ok" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "APPROVED");
    assert_eq!(body["data"]["notes"], "ok");

    let response = app(f.service.clone())
        .oneshot(json_request(
            "PUT",
            &format!("/api/claims/{}/status", created.id),
            serde_json::json!({ "status": "PENDING" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_CLAIM_STATUS");
}

#[tokio::test]
async fn test_http_list_by_status_and_unknown_claim() {
    let f = setup();

    let response = app(f.service.clone())
        .oneshot(
            Request::builder()
                .uri("/api/claims/status/pending")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["total"], 0);

    let response = app(f.service.clone())
        .oneshot(
            Request::builder()
                .uri("/api/claims/404")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(f.service.clone())
        .oneshot(
            Request::builder()
                .uri("/api/claims/status/shipped")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
