//! 奖励与领取记录
//!
//! 领取状态机：
//!
//! ```text
//! PENDING --approve--> APPROVED --cancel--> CANCELLED
//! PENDING --reject---> REJECTED
//! PENDING --cancel---> CANCELLED
//! ```
//!
//! REJECTED 和 CANCELLED 是终态。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use loyalty_shared::events::{ClaimStatusUpdated, RewardClaimed};
use loyalty_shared::tier::Tier;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

// ---------------------------------------------------------------------------
// ClaimStatus
// ---------------------------------------------------------------------------

/// 领取状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: ClaimStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Cancelled)
                | (Self::Approved, Self::Cancelled)
        )
    }

    /// 进入该状态时归还奖励库存
    pub fn releases_stock(&self) -> bool {
        self.is_terminal()
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("未知领取状态: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Reward
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: i64,
    pub name: String,
    #[sqlx(default)]
    pub description: Option<String>,
    pub point_cost: i64,
    /// 奖励自身的库存计数
    pub stock: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reward {
    /// 奖励所属档位，按积分成本计算
    pub fn tier(&self) -> Tier {
        Tier::for_points(self.point_cost)
    }

    pub fn has_stock(&self) -> bool {
        self.stock > 0
    }
}

/// 新建奖励
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewReward {
    #[validate(length(min = 1, max = 200, message = "名称长度 1-200"))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[validate(range(min = 1, message = "积分成本必须大于 0"))]
    pub point_cost: i64,
    #[validate(range(min = 0, message = "库存不能为负"))]
    pub stock: i32,
}

// ---------------------------------------------------------------------------
// RewardClaim
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RewardClaim {
    pub id: i64,
    pub user_id: String,
    pub reward_id: i64,
    /// 领取时的积分成本快照
    pub point_cost: i64,
    pub status: ClaimStatus,
    #[sqlx(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RewardClaim {
    pub fn tier(&self) -> Tier {
        Tier::for_points(self.point_cost)
    }

    pub fn claimed_event(&self) -> RewardClaimed {
        RewardClaimed {
            claim_id: self.id,
            user_id: self.user_id.clone(),
            reward_id: self.reward_id,
            points: self.point_cost,
            created_at: self.created_at,
        }
    }

    pub fn status_event(&self) -> ClaimStatusUpdated {
        ClaimStatusUpdated {
            claim_id: self.id,
            user_id: self.user_id.clone(),
            reward_id: self.reward_id,
            status: self.status.to_string(),
            updated_at: self.updated_at,
        }
    }
}

/// 每个用户每个档位终身只能领取一次，已有领取不论状态都计入
pub fn find_tier_conflict(claims: &[RewardClaim], tier: Tier) -> Option<&RewardClaim> {
    claims.iter().find(|claim| claim.tier() == tier)
}

/// 领取请求
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRewardRequest {
    #[validate(
        length(min = 1, max = 100, message = "用户 ID 长度 1-100"),
        custom(function = "validate_user_id")
    )]
    pub user_id: String,
    pub reward_id: i64,
}

/// 用户 ID 会作为积分服务 URL 的一个路径段，不能含路径分隔和点段
fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    let reserved = |c: char| {
        matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace() || c.is_control()
    };
    if user_id == "." || user_id == ".." || user_id.chars().any(reserved) {
        let mut error = ValidationError::new("user_id");
        error.message = Some("用户 ID 含有非法字符".into());
        return Err(error);
    }
    Ok(())
}

/// 管理员变更领取状态
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClaimStatusRequest {
    pub status: ClaimStatus,
    #[serde(default)]
    #[validate(length(max = 1000, message = "备注最多 1000 字"))]
    pub notes: Option<String>,
}

/// 状态变更结果
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimTransition {
    pub claim: RewardClaim,
    pub previous: ClaimStatus,
    pub stock_restored: bool,
}

/// 积分服务返回的余额
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBalanceView {
    pub user_id: String,
    pub total_points: i64,
    pub level: Tier,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn reward(id: i64, point_cost: i64, stock: i32) -> Reward {
        let now = Utc::now();
        Reward {
            id,
            name: format!("Reward {id}"),
            description: None,
            point_cost,
            stock,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn claim(id: i64, user_id: &str, point_cost: i64, status: ClaimStatus) -> RewardClaim {
        let now = Utc::now();
        RewardClaim {
            id,
            user_id: user_id.to_string(),
            reward_id: id,
            point_cost,
            status,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}
