//! 积分等级
//!
//! 用户等级和奖励档位共用同一组阈值：积分余额决定用户等级，
//! 奖励的积分成本决定奖励所属档位。阈值含边界，取满足条件的最高档。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl Tier {
    /// 按阈值升序排列
    pub const ALL: [Tier; 4] = [Tier::Bronze, Tier::Silver, Tier::Gold, Tier::Platinum];

    /// 进入该等级所需的最低积分
    pub const fn threshold(self) -> i64 {
        match self {
            Self::Bronze => 0,
            Self::Silver => 50,
            Self::Gold => 100,
            Self::Platinum => 200,
        }
    }

    /// 根据积分计算等级
    pub fn for_points(points: i64) -> Self {
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|tier| points >= tier.threshold())
            .unwrap_or(Self::Bronze)
    }

    /// 下一个等级，最高等级返回 None
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Bronze => Some(Self::Silver),
            Self::Silver => Some(Self::Gold),
            Self::Gold => Some(Self::Platinum),
            Self::Platinum => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bronze => "BRONZE",
            Self::Silver => "SILVER",
            Self::Gold => "GOLD",
            Self::Platinum => "PLATINUM",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BRONZE" => Ok(Self::Bronze),
            "SILVER" => Ok(Self::Silver),
            "GOLD" => Ok(Self::Gold),
            "PLATINUM" => Ok(Self::Platinum),
            other => Err(format!("未知等级: {other}")),
        }
    }
}

/// 等级进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierProgress {
    pub level: Tier,
    pub next_level: Option<Tier>,
    pub points_to_next: Option<i64>,
}

impl TierProgress {
    pub fn for_points(points: i64) -> Self {
        let level = Tier::for_points(points);
        let next_level = level.next();
        Self {
            level,
            next_level,
            points_to_next: next_level.map(|next| next.threshold() - points),
        }
    }
}
