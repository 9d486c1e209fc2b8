//! 内存奖励与领取存储
//!
//! 一把锁覆盖整个读-改-写，事件写入共享的内存 outbox。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use loyalty_shared::events::EventEnvelope;
use loyalty_shared::outbox::MemoryOutbox;
use parking_lot::Mutex;

use super::traits::ClaimStore;
use crate::SERVICE_NAME;
use crate::error::{ClaimError, Result};
use crate::models::{
    ClaimStatus, ClaimTransition, NewReward, Reward, RewardClaim, find_tier_conflict,
};

#[derive(Default)]
struct State {
    rewards: BTreeMap<i64, Reward>,
    claims: BTreeMap<i64, RewardClaim>,
    next_reward_id: i64,
    next_claim_id: i64,
}

pub struct MemoryClaimStore {
    state: Mutex<State>,
    outbox: Arc<MemoryOutbox>,
}

impl MemoryClaimStore {
    pub fn new(outbox: Arc<MemoryOutbox>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Arc<MemoryOutbox> {
        &self.outbox
    }

    pub fn set_active(&self, reward_id: i64, active: bool) {
        if let Some(reward) = self.state.lock().rewards.get_mut(&reward_id) {
            reward.active = active;
        }
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn get_reward(&self, id: i64) -> Result<Option<Reward>> {
        Ok(self.state.lock().rewards.get(&id).cloned())
    }

    async fn create_reward(&self, new_reward: &NewReward) -> Result<Reward> {
        let mut state = self.state.lock();
        state.next_reward_id += 1;
        let now = Utc::now();
        let reward = Reward {
            id: state.next_reward_id,
            name: new_reward.name.clone(),
            description: new_reward.description.clone(),
            point_cost: new_reward.point_cost,
            stock: new_reward.stock,
            active: true,
            created_at: now,
            updated_at: now,
        };
        state.rewards.insert(reward.id, reward.clone());
        Ok(reward)
    }

    async fn get_claim(&self, id: i64) -> Result<Option<RewardClaim>> {
        Ok(self.state.lock().claims.get(&id).cloned())
    }

    async fn list_user_claims(&self, user_id: &str) -> Result<Vec<RewardClaim>> {
        Ok(self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_claims(
        &self,
        status: Option<ClaimStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RewardClaim>, i64)> {
        let state = self.state.lock();
        let matching: Vec<&RewardClaim> = state
            .claims
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .collect();
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn create_claim(&self, user_id: &str, reward_id: i64) -> Result<RewardClaim> {
        let mut state = self.state.lock();

        let reward = state
            .rewards
            .get(&reward_id)
            .filter(|r| r.active)
            .cloned()
            .ok_or(ClaimError::RewardNotFound(reward_id))?;

        if !reward.has_stock() {
            return Err(ClaimError::InsufficientStock { reward_id });
        }

        let existing: Vec<RewardClaim> = state
            .claims
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        if let Some(conflict) = find_tier_conflict(&existing, reward.tier()) {
            return Err(ClaimError::TierAlreadyClaimed {
                tier: reward.tier(),
                claim_id: conflict.id,
            });
        }

        let now = Utc::now();
        let claim = RewardClaim {
            id: state.next_claim_id + 1,
            user_id: user_id.to_string(),
            reward_id,
            point_cost: reward.point_cost,
            status: ClaimStatus::Pending,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        let envelope = EventEnvelope::new(&claim.claimed_event(), SERVICE_NAME)?;
        // outbox 写入失败时不改动任何状态，与数据库事务回滚一致
        self.outbox.enqueue(&envelope)?;

        state.next_claim_id = claim.id;
        state.claims.insert(claim.id, claim.clone());
        if let Some(reward) = state.rewards.get_mut(&reward_id) {
            reward.stock -= 1;
            reward.updated_at = now;
        }

        Ok(claim)
    }

    async fn transition_claim(
        &self,
        claim_id: i64,
        status: ClaimStatus,
        notes: Option<String>,
    ) -> Result<ClaimTransition> {
        let mut state = self.state.lock();

        let current = state
            .claims
            .get(&claim_id)
            .cloned()
            .ok_or(ClaimError::ClaimNotFound(claim_id))?;

        if !current.status.can_transition_to(status) {
            return Err(ClaimError::InvalidClaimStatus {
                from: current.status,
                to: status,
            });
        }

        let now = Utc::now();
        let mut claim = current.clone();
        claim.status = status;
        if notes.is_some() {
            claim.notes = notes;
        }
        claim.updated_at = now;
        let envelope = EventEnvelope::new(&claim.status_event(), SERVICE_NAME)?;
        self.outbox.enqueue(&envelope)?;

        let stock_restored = status.releases_stock();
        if stock_restored
            && let Some(reward) = state.rewards.get_mut(&claim.reward_id)
        {
            reward.stock += 1;
            reward.updated_at = now;
        }
        state.claims.insert(claim.id, claim.clone());

        Ok(ClaimTransition {
            claim,
            previous: current.status,
            stock_restored,
        })
    }
}
