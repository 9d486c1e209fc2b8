//! 仓储 Trait 定义

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AccrualOutcome, PointHistory, PointResetHistory, UserPoints};

/// 积分台账仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PointLedgerRepository: Send + Sync {
    async fn get_user_points(&self, user_id: &str) -> Result<Option<UserPoints>>;

    /// 在行锁内完成：惰性建档、到期重置、每日上限检查、追加流水
    async fn accrue(
        &self,
        user_id: &str,
        feedback_id: i64,
        now: DateTime<Utc>,
    ) -> Result<AccrualOutcome>;

    /// 按时间倒序分页，返回 (当页记录, 总数)
    async fn list_history(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<PointHistory>, i64)>;

    async fn list_resets(&self, user_id: &str) -> Result<Vec<PointResetHistory>>;
}
