//! 仓储 Trait 定义

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ClaimStatus, ClaimTransition, NewReward, Reward, RewardClaim};

/// 奖励与领取仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClaimStore: Send + Sync {
    // 奖励
    async fn get_reward(&self, id: i64) -> Result<Option<Reward>>;
    async fn create_reward(&self, reward: &NewReward) -> Result<Reward>;

    // 领取
    async fn get_claim(&self, id: i64) -> Result<Option<RewardClaim>>;
    /// 按 id 升序
    async fn list_user_claims(&self, user_id: &str) -> Result<Vec<RewardClaim>>;
    /// 按 id 倒序分页，返回 (当页记录, 总数)
    async fn list_claims(
        &self,
        status: Option<ClaimStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RewardClaim>, i64)>;

    /// 原子地创建领取：锁定奖励行，复核上架、库存和档位唯一，
    /// 写入 PENDING 领取、扣减奖励库存并写入 `reward.claimed` outbox 事件
    async fn create_claim(&self, user_id: &str, reward_id: i64) -> Result<RewardClaim>;

    /// 原子地变更状态：锁定领取行，校验状态机，进入终态时归还奖励库存，
    /// 写入 `reward.claim_status_updated` outbox 事件
    async fn transition_claim(
        &self,
        claim_id: i64,
        status: ClaimStatus,
        notes: Option<String>,
    ) -> Result<ClaimTransition>;
}
