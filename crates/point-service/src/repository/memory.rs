//! 内存积分台账
//!
//! 一把锁覆盖整个读-改-写，与数据库行锁语义一致。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::traits::PointLedgerRepository;
use crate::error::Result;
use crate::models::{AccrualOutcome, POINTS_PER_FEEDBACK, PointHistory, PointResetHistory, UserPoints};

#[derive(Default)]
struct State {
    balances: HashMap<String, UserPoints>,
    history: Vec<PointHistory>,
    resets: Vec<PointResetHistory>,
    next_history_id: i64,
    next_reset_id: i64,
}

#[derive(Default)]
pub struct MemoryPointLedger {
    state: Mutex<State>,
}

impl MemoryPointLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入余额行，用于构造历史数据
    pub fn seed(&self, points: UserPoints) {
        self.state
            .lock()
            .balances
            .insert(points.user_id.clone(), points);
    }

    /// 用户全部获取流水，按写入顺序
    pub fn history(&self, user_id: &str) -> Vec<PointHistory> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PointLedgerRepository for MemoryPointLedger {
    async fn get_user_points(&self, user_id: &str) -> Result<Option<UserPoints>> {
        Ok(self.state.lock().balances.get(user_id).cloned())
    }

    async fn accrue(
        &self,
        user_id: &str,
        feedback_id: i64,
        now: DateTime<Utc>,
    ) -> Result<AccrualOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state
            .history
            .iter()
            .any(|h| h.user_id == user_id && h.source_feedback_id == feedback_id)
        {
            return Ok(AccrualOutcome::AlreadyAwarded);
        }

        let points = state
            .balances
            .entry(user_id.to_string())
            .or_insert_with(|| UserPoints::open(user_id, now));

        let reset = points.reset_if_due(now).map(|snapshot| {
            state.next_reset_id += 1;
            let reset = PointResetHistory {
                id: state.next_reset_id,
                user_id: snapshot.user_id,
                reset_date: snapshot.reset_date,
                points_before_reset: snapshot.points_before_reset,
                next_reset_date: snapshot.next_reset_date,
            };
            state.resets.push(reset.clone());
            reset
        });

        if points.has_earned_on(now.date_naive()) {
            return Ok(AccrualOutcome::DailyLimitReached { reset });
        }

        state.next_history_id += 1;
        let history = PointHistory {
            id: state.next_history_id,
            user_id: user_id.to_string(),
            points_earned: POINTS_PER_FEEDBACK,
            date_earned: now,
            earned_on: now.date_naive(),
            source_feedback_id: feedback_id,
        };
        points.record_earn(history.points_earned, now);
        state.history.push(history.clone());

        Ok(AccrualOutcome::Earned {
            points: points.clone(),
            history,
            reset,
        })
    }

    async fn list_history(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<PointHistory>, i64)> {
        let all = self.history(user_id);
        let total = all.len() as i64;
        let page = all
            .into_iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn list_resets(&self, user_id: &str) -> Result<Vec<PointResetHistory>> {
        Ok(self
            .state
            .lock()
            .resets
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}
