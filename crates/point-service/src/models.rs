//! 积分台账领域模型
//!
//! 余额行上的日期字段决定状态：
//! - `now > next_reset_date` 时先做年度重置（惰性触发，没有后台调度）
//! - `last_point_earned_date` 与当前 UTC 日期相同时今日不能再获取积分

use chrono::{DateTime, Months, NaiveDate, Utc};
use loyalty_shared::tier::{Tier, TierProgress};
use serde::{Deserialize, Serialize};

/// 每条合格反馈获得的积分
pub const POINTS_PER_FEEDBACK: i32 = 1;

/// 重置周期
pub const RESET_PERIOD: Months = Months::new(12);

pub fn next_reset_after(date: DateTime<Utc>) -> DateTime<Utc> {
    date.checked_add_months(RESET_PERIOD)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// UserPoints
// ---------------------------------------------------------------------------

/// 用户积分余额
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserPoints {
    pub user_id: String,
    pub total_points: i64,
    pub last_point_earned_date: Option<DateTime<Utc>>,
    pub registration_date: DateTime<Utc>,
    pub last_reset_date: DateTime<Utc>,
    pub next_reset_date: DateTime<Utc>,
}

impl UserPoints {
    /// 首次获取积分时惰性创建
    pub fn open(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            total_points: 0,
            last_point_earned_date: None,
            registration_date: now,
            last_reset_date: now,
            next_reset_date: next_reset_after(now),
        }
    }

    pub fn is_reset_due(&self, now: DateTime<Utc>) -> bool {
        now > self.next_reset_date
    }

    /// 到期则清零并返回重置快照
    pub fn reset_if_due(&mut self, now: DateTime<Utc>) -> Option<ResetSnapshot> {
        if !self.is_reset_due(now) {
            return None;
        }

        let snapshot = ResetSnapshot {
            user_id: self.user_id.clone(),
            reset_date: now,
            points_before_reset: self.total_points,
            next_reset_date: next_reset_after(now),
        };
        self.total_points = 0;
        self.last_reset_date = now;
        self.next_reset_date = snapshot.next_reset_date;
        Some(snapshot)
    }

    /// 同一 UTC 自然日最多获取一次
    pub fn has_earned_on(&self, day: NaiveDate) -> bool {
        self.last_point_earned_date
            .is_some_and(|last| last.date_naive() == day)
    }

    pub fn record_earn(&mut self, points: i32, now: DateTime<Utc>) {
        self.total_points += i64::from(points);
        self.last_point_earned_date = Some(now);
    }

    pub fn balance(&self) -> PointBalance {
        PointBalance::new(&self.user_id, self.total_points)
    }
}

// ---------------------------------------------------------------------------
// 流水
// ---------------------------------------------------------------------------

/// 积分获取流水
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PointHistory {
    pub id: i64,
    pub user_id: String,
    pub points_earned: i32,
    pub date_earned: DateTime<Utc>,
    pub earned_on: NaiveDate,
    pub source_feedback_id: i64,
}

/// 年度重置记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PointResetHistory {
    pub id: i64,
    pub user_id: String,
    pub reset_date: DateTime<Utc>,
    pub points_before_reset: i64,
    pub next_reset_date: DateTime<Utc>,
}

/// 尚未落库的重置记录
#[derive(Debug, Clone, PartialEq)]
pub struct ResetSnapshot {
    pub user_id: String,
    pub reset_date: DateTime<Utc>,
    pub points_before_reset: i64,
    pub next_reset_date: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 余额与结果
// ---------------------------------------------------------------------------

/// 余额查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBalance {
    pub user_id: String,
    pub total_points: i64,
    pub level: Tier,
    pub next_level: Option<Tier>,
    pub points_to_next: Option<i64>,
}

impl PointBalance {
    pub fn new(user_id: &str, total_points: i64) -> Self {
        let progress = TierProgress::for_points(total_points);
        Self {
            user_id: user_id.to_string(),
            total_points,
            level: progress.level,
            next_level: progress.next_level,
            points_to_next: progress.points_to_next,
        }
    }

    /// 没有积分记录的用户
    pub fn empty(user_id: &str) -> Self {
        Self::new(user_id, 0)
    }
}

/// 一次积分获取尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualOutcome {
    Earned {
        points: UserPoints,
        history: PointHistory,
        reset: Option<PointResetHistory>,
    },
    /// 今日已获取过；到期的重置仍会落库
    DailyLimitReached { reset: Option<PointResetHistory> },
    /// 该反馈已发放过积分
    AlreadyAwarded,
}

/// 积分获取成功的返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointAward {
    pub history: PointHistory,
    pub balance: PointBalance,
    pub reset_applied: bool,
}
