//! 领取生命周期管理
//!
//! ## 领取流程
//!
//! 1. 奖励存在且上架 -> 2. 奖励库存 -> 3. 同步查询积分余额
//!    -> 4. 档位唯一 -> 5. 事务内复核并写入领取、扣减库存、写入 outbox
//!
//! 积分只作为领取门槛，领取不扣减积分。

use std::sync::Arc;

use loyalty_shared::http::{PageResponse, PaginationParams};
use loyalty_shared::observability::metrics;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::client::PointBalanceClient;
use crate::error::{ClaimError, Result};
use crate::models::{
    ClaimRewardRequest, ClaimStatus, NewReward, Reward, RewardClaim, UpdateClaimStatusRequest,
    find_tier_conflict,
};
use crate::repository::ClaimStore;

pub struct ClaimService {
    store: Arc<dyn ClaimStore>,
    points: Arc<dyn PointBalanceClient>,
}

impl ClaimService {
    pub fn new(store: Arc<dyn ClaimStore>, points: Arc<dyn PointBalanceClient>) -> Self {
        Self { store, points }
    }

    // ---- 领取 ----

    #[instrument(skip(self, request), fields(user_id = %request.user_id, reward_id = request.reward_id))]
    pub async fn claim_reward(&self, request: ClaimRewardRequest) -> Result<RewardClaim> {
        let result = self.try_claim(&request).await;

        match &result {
            Ok(claim) => {
                metrics::record_claim("success");
                info!(
                    claim_id = claim.id,
                    point_cost = claim.point_cost,
                    tier = %claim.tier(),
                    "奖励领取成功"
                );
            }
            Err(e) => {
                metrics::record_claim(e.error_code());
                if e.is_retryable() {
                    warn!(error = %e, "奖励领取失败");
                } else {
                    info!(reason = %e, "奖励领取被拒绝");
                }
            }
        }

        result
    }

    async fn try_claim(&self, request: &ClaimRewardRequest) -> Result<RewardClaim> {
        request.validate()?;

        // 1-2. 奖励与库存
        let reward = self.get_reward(request.reward_id).await?;
        if !reward.has_stock() {
            return Err(ClaimError::InsufficientStock {
                reward_id: reward.id,
            });
        }

        // 3. 积分门槛
        let balance = self.points.get_balance(&request.user_id).await?;
        if balance.total_points < reward.point_cost {
            return Err(ClaimError::InsufficientPoints {
                required: reward.point_cost,
                available: balance.total_points,
            });
        }

        // 4. 档位唯一
        let existing = self.store.list_user_claims(&request.user_id).await?;
        if let Some(conflict) = find_tier_conflict(&existing, reward.tier()) {
            return Err(ClaimError::TierAlreadyClaimed {
                tier: reward.tier(),
                claim_id: conflict.id,
            });
        }

        // 5. 锁内复核并落库
        self.store
            .create_claim(&request.user_id, request.reward_id)
            .await
    }

    /// 管理员变更领取状态
    #[instrument(skip(self, request), fields(claim_id = claim_id, status = %request.status))]
    pub async fn update_claim_status(
        &self,
        claim_id: i64,
        request: UpdateClaimStatusRequest,
    ) -> Result<RewardClaim> {
        request.validate()?;

        let transition = self
            .store
            .transition_claim(claim_id, request.status, request.notes)
            .await?;

        metrics::record_claim_transition(
            transition.previous.as_str(),
            transition.claim.status.as_str(),
        );
        info!(
            from = %transition.previous,
            to = %transition.claim.status,
            reward_id = transition.claim.reward_id,
            stock_restored = transition.stock_restored,
            "领取状态已变更"
        );

        Ok(transition.claim)
    }

    // ---- 查询 ----

    pub async fn get_claim(&self, claim_id: i64) -> Result<RewardClaim> {
        self.store
            .get_claim(claim_id)
            .await?
            .ok_or(ClaimError::ClaimNotFound(claim_id))
    }

    pub async fn list_claims(
        &self,
        pagination: &PaginationParams,
    ) -> Result<PageResponse<RewardClaim>> {
        self.page(None, pagination).await
    }

    pub async fn list_claims_by_status(
        &self,
        status: ClaimStatus,
        pagination: &PaginationParams,
    ) -> Result<PageResponse<RewardClaim>> {
        self.page(Some(status), pagination).await
    }

    pub async fn list_user_claims(&self, user_id: &str) -> Result<Vec<RewardClaim>> {
        self.store.list_user_claims(user_id).await
    }

    /// 已下架的奖励视同不存在
    pub async fn get_reward(&self, reward_id: i64) -> Result<Reward> {
        self.store
            .get_reward(reward_id)
            .await?
            .filter(|r| r.active)
            .ok_or(ClaimError::RewardNotFound(reward_id))
    }

    pub async fn create_reward(&self, reward: NewReward) -> Result<Reward> {
        reward.validate()?;
        let reward = self.store.create_reward(&reward).await?;
        info!(reward_id = reward.id, point_cost = reward.point_cost, stock = reward.stock, "奖励已创建");
        Ok(reward)
    }

    async fn page(
        &self,
        status: Option<ClaimStatus>,
        pagination: &PaginationParams,
    ) -> Result<PageResponse<RewardClaim>> {
        let (items, total) = self
            .store
            .list_claims(status, pagination.limit(), pagination.offset())
            .await?;
        Ok(PageResponse::new(
            items,
            total,
            pagination.page.max(1),
            pagination.limit(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockPointBalanceClient;
    use crate::models::{PointBalanceView, fixtures};
    use crate::repository::MockClaimStore;
    use loyalty_shared::tier::Tier;

    fn balance(total_points: i64) -> PointBalanceView {
        PointBalanceView {
            user_id: "u-1".to_string(),
            total_points,
            level: Tier::for_points(total_points),
        }
    }

    fn request(reward_id: i64) -> ClaimRewardRequest {
        ClaimRewardRequest {
            user_id: "u-1".to_string(),
            reward_id,
        }
    }

    #[tokio::test]
    async fn test_out_of_stock_skips_point_lookup() {
        let mut store = MockClaimStore::new();
        store
            .expect_get_reward()
            .returning(|id| Ok(Some(fixtures::reward(id, 150, 0))));
        store.expect_create_claim().never();
        let mut points = MockPointBalanceClient::new();
        points.expect_get_balance().never();

        let service = ClaimService::new(Arc::new(store), Arc::new(points));
        let err = service.claim_reward(request(1)).await.unwrap_err();
        assert!(matches!(err, ClaimError::InsufficientStock { reward_id: 1 }));
    }

    #[tokio::test]
    async fn test_insufficient_points() {
        let mut store = MockClaimStore::new();
        store
            .expect_get_reward()
            .returning(|id| Ok(Some(fixtures::reward(id, 150, 3))));
        store.expect_create_claim().never();
        let mut points = MockPointBalanceClient::new();
        points
            .expect_get_balance()
            .withf(|user_id| user_id == "u-1")
            .returning(|_| Ok(balance(149)));

        let service = ClaimService::new(Arc::new(store), Arc::new(points));
        let err = service.claim_reward(request(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ClaimError::InsufficientPoints {
                required: 150,
                available: 149
            }
        ));
    }

    #[tokio::test]
    async fn test_upstream_failure_creates_no_claim() {
        let mut store = MockClaimStore::new();
        store
            .expect_get_reward()
            .returning(|id| Ok(Some(fixtures::reward(id, 150, 3))));
        store.expect_create_claim().never();
        let mut points = MockPointBalanceClient::new();
        points.expect_get_balance().returning(|_| {
            Err(ClaimError::UpstreamUnavailable {
                service: "point-service".to_string(),
            })
        });

        let service = ClaimService::new(Arc::new(store), Arc::new(points));
        let err = service.claim_reward(request(1)).await.unwrap_err();
        assert!(matches!(err, ClaimError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_same_tier_is_rejected_before_write() {
        let mut store = MockClaimStore::new();
        store
            .expect_get_reward()
            .returning(|id| Ok(Some(fixtures::reward(id, 120, 3))));
        store.expect_list_user_claims().returning(|_| {
            Ok(vec![fixtures::claim(8, "u-1", 180, ClaimStatus::Approved)])
        });
        store.expect_create_claim().never();
        let mut points = MockPointBalanceClient::new();
        points.expect_get_balance().returning(|_| Ok(balance(500)));

        let service = ClaimService::new(Arc::new(store), Arc::new(points));
        let err = service.claim_reward(request(2)).await.unwrap_err();
        assert!(matches!(
            err,
            ClaimError::TierAlreadyClaimed {
                tier: Tier::Gold,
                claim_id: 8
            }
        ));
    }

    #[tokio::test]
    async fn test_inactive_reward_is_not_found() {
        let mut store = MockClaimStore::new();
        store.expect_get_reward().returning(|id| {
            let mut reward = fixtures::reward(id, 50, 3);
            reward.active = false;
            Ok(Some(reward))
        });

        let service = ClaimService::new(Arc::new(store), Arc::new(MockPointBalanceClient::new()));
        let err = service.get_reward(4).await.unwrap_err();
        assert!(matches!(err, ClaimError::RewardNotFound(4)));
    }
}
