//! 积分获取引擎
//!
//! 每条反馈最多获得一次积分，每个 UTC 自然日最多获得一次，
//! 余额每年惰性重置一次。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use loyalty_shared::http::{PageResponse, PaginationParams};
use loyalty_shared::observability::metrics;
use tracing::{debug, info, instrument};

use crate::error::{PointError, Result};
use crate::models::{AccrualOutcome, PointAward, PointBalance, PointHistory, PointResetHistory};
use crate::repository::PointLedgerRepository;

pub struct PointService {
    repo: Arc<dyn PointLedgerRepository>,
}

impl PointService {
    pub fn new(repo: Arc<dyn PointLedgerRepository>) -> Self {
        Self { repo }
    }

    /// 反馈积分
    pub async fn process_feedback_point(&self, user_id: &str, feedback_id: i64) -> Result<PointAward> {
        self.process_feedback_point_at(user_id, feedback_id, Utc::now())
            .await
    }

    /// 以指定时间处理反馈积分
    #[instrument(skip(self))]
    pub async fn process_feedback_point_at(
        &self,
        user_id: &str,
        feedback_id: i64,
        now: DateTime<Utc>,
    ) -> Result<PointAward> {
        if user_id.trim().is_empty() {
            return Err(PointError::Validation("user_id 不能为空".to_string()));
        }

        let outcome = self.repo.accrue(user_id, feedback_id, now).await?;

        match outcome {
            AccrualOutcome::Earned {
                points,
                history,
                reset,
            } => {
                if let Some(reset) = &reset {
                    Self::log_reset(reset);
                }
                metrics::record_point_accrual("earned");
                info!(
                    user_id,
                    feedback_id,
                    total_points = points.total_points,
                    "积分已发放"
                );
                Ok(PointAward {
                    history,
                    balance: points.balance(),
                    reset_applied: reset.is_some(),
                })
            }
            AccrualOutcome::DailyLimitReached { reset } => {
                if let Some(reset) = &reset {
                    Self::log_reset(reset);
                }
                metrics::record_point_accrual("daily_limit");
                debug!(user_id, feedback_id, "今日积分已达上限");
                Err(PointError::DailyLimitReached {
                    user_id: user_id.to_string(),
                })
            }
            AccrualOutcome::AlreadyAwarded => {
                metrics::record_point_accrual("duplicate");
                debug!(user_id, feedback_id, "反馈已发放过积分");
                Err(PointError::AlreadyAwarded {
                    user_id: user_id.to_string(),
                    feedback_id,
                })
            }
        }
    }

    /// 余额和等级；没有积分记录的用户返回 0 分
    pub async fn get_balance(&self, user_id: &str) -> Result<PointBalance> {
        let balance = self
            .repo
            .get_user_points(user_id)
            .await?
            .map(|points| points.balance())
            .unwrap_or_else(|| PointBalance::empty(user_id));
        Ok(balance)
    }

    pub async fn history(
        &self,
        user_id: &str,
        pagination: &PaginationParams,
    ) -> Result<PageResponse<PointHistory>> {
        let (items, total) = self
            .repo
            .list_history(user_id, pagination.limit(), pagination.offset())
            .await?;
        Ok(PageResponse::new(
            items,
            total,
            pagination.page.max(1),
            pagination.limit(),
        ))
    }

    pub async fn resets(&self, user_id: &str) -> Result<Vec<PointResetHistory>> {
        self.repo.list_resets(user_id).await
    }

    fn log_reset(reset: &PointResetHistory) {
        metrics::record_point_reset();
        info!(
            user_id = %reset.user_id,
            points_before_reset = reset.points_before_reset,
            next_reset_date = %reset.next_reset_date,
            "积分年度重置"
        );
    }
}
