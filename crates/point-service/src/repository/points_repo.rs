//! 积分台账仓储（PostgreSQL）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::instrument;

use super::traits::PointLedgerRepository;
use crate::error::{PointError, Result};
use crate::models::{
    AccrualOutcome, POINTS_PER_FEEDBACK, PointHistory, PointResetHistory, ResetSnapshot,
    UserPoints,
};

const USER_POINTS_COLUMNS: &str = "user_id, total_points, last_point_earned_date, \
     registration_date, last_reset_date, next_reset_date";

pub struct PointsRepository {
    pool: PgPool,
}

impl PointsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 不存在则建档，然后锁定余额行
    pub async fn open_and_lock_in_tx(
        conn: &mut PgConnection,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserPoints> {
        let fresh = UserPoints::open(user_id, now);
        sqlx::query(
            r#"
            INSERT INTO user_points
                (user_id, total_points, registration_date, last_reset_date, next_reset_date)
            VALUES ($1, 0, $2, $3, $4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&fresh.user_id)
        .bind(fresh.registration_date)
        .bind(fresh.last_reset_date)
        .bind(fresh.next_reset_date)
        .execute(&mut *conn)
        .await?;

        let points = sqlx::query_as::<_, UserPoints>(&format!(
            "SELECT {USER_POINTS_COLUMNS} FROM user_points WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(points)
    }

    pub async fn insert_reset_in_tx(
        conn: &mut PgConnection,
        snapshot: &ResetSnapshot,
    ) -> Result<PointResetHistory> {
        let reset = sqlx::query_as::<_, PointResetHistory>(
            r#"
            INSERT INTO point_reset_history (user_id, reset_date, points_before_reset, next_reset_date)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, reset_date, points_before_reset, next_reset_date
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(snapshot.reset_date)
        .bind(snapshot.points_before_reset)
        .bind(snapshot.next_reset_date)
        .fetch_one(conn)
        .await?;

        Ok(reset)
    }

    pub async fn insert_history_in_tx(
        conn: &mut PgConnection,
        user_id: &str,
        feedback_id: i64,
        now: DateTime<Utc>,
    ) -> Result<PointHistory> {
        sqlx::query_as::<_, PointHistory>(
            r#"
            INSERT INTO point_history (user_id, points_earned, date_earned, earned_on, source_feedback_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, points_earned, date_earned, earned_on, source_feedback_id
            "#,
        )
        .bind(user_id)
        .bind(POINTS_PER_FEEDBACK)
        .bind(now)
        .bind(now.date_naive())
        .bind(feedback_id)
        .fetch_one(conn)
        .await
        .map_err(|e| map_history_conflict(e, user_id, feedback_id))
    }

    pub async fn save_points_in_tx(conn: &mut PgConnection, points: &UserPoints) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_points
            SET total_points = $2,
                last_point_earned_date = $3,
                last_reset_date = $4,
                next_reset_date = $5,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(&points.user_id)
        .bind(points.total_points)
        .bind(points.last_point_earned_date)
        .bind(points.last_reset_date)
        .bind(points.next_reset_date)
        .execute(conn)
        .await?;

        Ok(())
    }
}

/// 行锁之外的并发写入最终由唯一约束兜住
fn map_history_conflict(err: sqlx::Error, user_id: &str, feedback_id: i64) -> PointError {
    let constraint = match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            db_err.constraint().map(str::to_string)
        }
        _ => None,
    };

    match constraint.as_deref() {
        Some("uq_point_history_feedback") => PointError::AlreadyAwarded {
            user_id: user_id.to_string(),
            feedback_id,
        },
        Some("uq_point_history_daily") => PointError::DailyLimitReached {
            user_id: user_id.to_string(),
        },
        _ => PointError::Database(err),
    }
}

#[async_trait]
impl PointLedgerRepository for PointsRepository {
    async fn get_user_points(&self, user_id: &str) -> Result<Option<UserPoints>> {
        let points = sqlx::query_as::<_, UserPoints>(&format!(
            "SELECT {USER_POINTS_COLUMNS} FROM user_points WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(points)
    }

    #[instrument(skip(self), fields(user_id = %user_id, feedback_id = feedback_id))]
    async fn accrue(
        &self,
        user_id: &str,
        feedback_id: i64,
        now: DateTime<Utc>,
    ) -> Result<AccrualOutcome> {
        let mut tx = self.pool.begin().await?;

        let mut points = Self::open_and_lock_in_tx(&mut tx, user_id, now).await?;

        let already: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM point_history WHERE user_id = $1 AND source_feedback_id = $2)",
        )
        .bind(user_id)
        .bind(feedback_id)
        .fetch_one(&mut *tx)
        .await?;
        if already {
            tx.rollback().await?;
            return Ok(AccrualOutcome::AlreadyAwarded);
        }

        let reset = match points.reset_if_due(now) {
            Some(snapshot) => Some(Self::insert_reset_in_tx(&mut tx, &snapshot).await?),
            None => None,
        };

        if points.has_earned_on(now.date_naive()) {
            if reset.is_some() {
                Self::save_points_in_tx(&mut tx, &points).await?;
            }
            tx.commit().await?;
            return Ok(AccrualOutcome::DailyLimitReached { reset });
        }

        let history = Self::insert_history_in_tx(&mut tx, user_id, feedback_id, now).await?;
        points.record_earn(history.points_earned, now);
        Self::save_points_in_tx(&mut tx, &points).await?;

        tx.commit().await?;

        Ok(AccrualOutcome::Earned {
            points,
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
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM point_history WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let history = sqlx::query_as::<_, PointHistory>(
            r#"
            SELECT id, user_id, points_earned, date_earned, earned_on, source_feedback_id
            FROM point_history
            WHERE user_id = $1
            ORDER BY date_earned DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((history, total))
    }

    async fn list_resets(&self, user_id: &str) -> Result<Vec<PointResetHistory>> {
        let resets = sqlx::query_as::<_, PointResetHistory>(
            r#"
            SELECT id, user_id, reset_date, points_before_reset, next_reset_date
            FROM point_reset_history
            WHERE user_id = $1
            ORDER BY reset_date DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(resets)
    }
}
