//! 奖励与领取仓储（PostgreSQL）

use async_trait::async_trait;
use loyalty_shared::events::EventEnvelope;
use loyalty_shared::outbox::PgOutbox;
use sqlx::{PgConnection, PgPool};
use tracing::instrument;

use super::traits::ClaimStore;
use crate::SERVICE_NAME;
use crate::error::{ClaimError, Result};
use crate::models::{
    ClaimStatus, ClaimTransition, NewReward, Reward, RewardClaim, find_tier_conflict,
};

const REWARD_COLUMNS: &str =
    "id, name, description, point_cost, stock, active, created_at, updated_at";
const CLAIM_COLUMNS: &str =
    "id, user_id, reward_id, point_cost, status, notes, created_at, updated_at";

pub struct ClaimRepository {
    pool: PgPool,
}

impl ClaimRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在事务中锁定奖励行
    pub async fn lock_reward_in_tx(conn: &mut PgConnection, id: i64) -> Result<Option<Reward>> {
        let reward = sqlx::query_as::<_, Reward>(&format!(
            "SELECT {REWARD_COLUMNS} FROM rewards WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?;

        Ok(reward)
    }

    /// 在事务中锁定领取行
    pub async fn lock_claim_in_tx(conn: &mut PgConnection, id: i64) -> Result<Option<RewardClaim>> {
        let claim = sqlx::query_as::<_, RewardClaim>(&format!(
            "SELECT {CLAIM_COLUMNS} FROM reward_claims WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?;

        Ok(claim)
    }

    /// 同一用户的领取串行化，档位唯一检查才可靠
    pub async fn lock_user_in_tx(conn: &mut PgConnection, user_id: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('reward_claims:' || $1))")
            .bind(user_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn adjust_reward_stock_in_tx(
        conn: &mut PgConnection,
        reward_id: i64,
        delta: i32,
    ) -> Result<()> {
        sqlx::query("UPDATE rewards SET stock = stock + $2, updated_at = NOW() WHERE id = $1")
            .bind(reward_id)
            .bind(delta)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn user_claims(
        conn: &mut PgConnection,
        user_id: &str,
    ) -> Result<Vec<RewardClaim>> {
        let claims = sqlx::query_as::<_, RewardClaim>(&format!(
            "SELECT {CLAIM_COLUMNS} FROM reward_claims WHERE user_id = $1 ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(conn)
        .await?;

        Ok(claims)
    }
}

#[async_trait]
impl ClaimStore for ClaimRepository {
    async fn get_reward(&self, id: i64) -> Result<Option<Reward>> {
        let reward = sqlx::query_as::<_, Reward>(&format!(
            "SELECT {REWARD_COLUMNS} FROM rewards WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(reward)
    }

    async fn create_reward(&self, reward: &NewReward) -> Result<Reward> {
        let created = sqlx::query_as::<_, Reward>(&format!(
            r#"
            INSERT INTO rewards (name, description, point_cost, stock)
            VALUES ($1, $2, $3, $4)
            RETURNING {REWARD_COLUMNS}
            "#
        ))
        .bind(&reward.name)
        .bind(&reward.description)
        .bind(reward.point_cost)
        .bind(reward.stock)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn get_claim(&self, id: i64) -> Result<Option<RewardClaim>> {
        let claim = sqlx::query_as::<_, RewardClaim>(&format!(
            "SELECT {CLAIM_COLUMNS} FROM reward_claims WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claim)
    }

    async fn list_user_claims(&self, user_id: &str) -> Result<Vec<RewardClaim>> {
        let mut conn = self.pool.acquire().await?;
        Self::user_claims(&mut conn, user_id).await
    }

    async fn list_claims(
        &self,
        status: Option<ClaimStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RewardClaim>, i64)> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reward_claims WHERE ($1::varchar IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let claims = sqlx::query_as::<_, RewardClaim>(&format!(
            r#"
            SELECT {CLAIM_COLUMNS}
            FROM reward_claims
            WHERE ($1::varchar IS NULL OR status = $1)
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((claims, total))
    }

    #[instrument(skip(self), fields(user_id = %user_id, reward_id = reward_id))]
    async fn create_claim(&self, user_id: &str, reward_id: i64) -> Result<RewardClaim> {
        let mut tx = self.pool.begin().await?;

        Self::lock_user_in_tx(&mut tx, user_id).await?;
        let reward = Self::lock_reward_in_tx(&mut tx, reward_id)
            .await?
            .filter(|r| r.active)
            .ok_or(ClaimError::RewardNotFound(reward_id))?;

        if !reward.has_stock() {
            return Err(ClaimError::InsufficientStock { reward_id });
        }

        let existing = Self::user_claims(&mut tx, user_id).await?;
        if let Some(conflict) = find_tier_conflict(&existing, reward.tier()) {
            return Err(ClaimError::TierAlreadyClaimed {
                tier: reward.tier(),
                claim_id: conflict.id,
            });
        }

        let claim = sqlx::query_as::<_, RewardClaim>(&format!(
            r#"
            INSERT INTO reward_claims (user_id, reward_id, point_cost, status)
            VALUES ($1, $2, $3, $4)
            RETURNING {CLAIM_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(reward_id)
        .bind(reward.point_cost)
        .bind(ClaimStatus::Pending)
        .fetch_one(&mut *tx)
        .await?;

        Self::adjust_reward_stock_in_tx(&mut tx, reward_id, -1).await?;

        let envelope = EventEnvelope::new(&claim.claimed_event(), SERVICE_NAME)?;
        PgOutbox::enqueue_in_tx(&mut tx, &envelope).await?;

        tx.commit().await?;
        Ok(claim)
    }

    #[instrument(skip(self, notes), fields(claim_id = claim_id, status = %status))]
    async fn transition_claim(
        &self,
        claim_id: i64,
        status: ClaimStatus,
        notes: Option<String>,
    ) -> Result<ClaimTransition> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_claim_in_tx(&mut tx, claim_id)
            .await?
            .ok_or(ClaimError::ClaimNotFound(claim_id))?;

        if !current.status.can_transition_to(status) {
            return Err(ClaimError::InvalidClaimStatus {
                from: current.status,
                to: status,
            });
        }

        let claim = sqlx::query_as::<_, RewardClaim>(&format!(
            r#"
            UPDATE reward_claims
            SET status = $2, notes = COALESCE($3, notes), updated_at = NOW()
            WHERE id = $1
            RETURNING {CLAIM_COLUMNS}
            "#
        ))
        .bind(claim_id)
        .bind(status)
        .bind(&notes)
        .fetch_one(&mut *tx)
        .await?;

        let stock_restored = status.releases_stock();
        if stock_restored {
            Self::adjust_reward_stock_in_tx(&mut tx, claim.reward_id, 1).await?;
        }

        let envelope = EventEnvelope::new(&claim.status_event(), SERVICE_NAME)?;
        PgOutbox::enqueue_in_tx(&mut tx, &envelope).await?;

        tx.commit().await?;

        Ok(ClaimTransition {
            claim,
            previous: current.status,
            stock_restored,
        })
    }
}
