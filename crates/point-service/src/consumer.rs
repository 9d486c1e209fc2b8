//! 反馈事件消费者
//!
//! 队列 `point.feedback` 绑定 `feedback.events` 上的 `feedback.created`，
//! 每条新反馈尝试为作者发放积分。

use std::sync::Arc;

use async_trait::async_trait;
use loyalty_shared::bus::{EventHandler, HandlerError, QueueBinding};
use loyalty_shared::events::{EventEnvelope, FeedbackCreated, exchanges, routing_keys};
use tracing::{debug, info, warn};

use crate::error::PointError;
use crate::service::PointService;

pub const FEEDBACK_QUEUE: &str = "point.feedback";

pub fn feedback_binding() -> QueueBinding {
    QueueBinding::new(FEEDBACK_QUEUE, exchanges::FEEDBACK).bind(routing_keys::FEEDBACK_CREATED)
}

impl From<PointError> for HandlerError {
    fn from(err: PointError) -> Self {
        if err.is_retryable() {
            HandlerError::Retryable(err.to_string())
        } else {
            HandlerError::Rejected(err.to_string())
        }
    }
}

pub struct FeedbackPointHandler {
    points: Arc<PointService>,
}

impl FeedbackPointHandler {
    pub fn new(points: Arc<PointService>) -> Self {
        Self { points }
    }
}

#[async_trait]
impl EventHandler for FeedbackPointHandler {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        if !event.is::<FeedbackCreated>() {
            debug!(routing_key = %event.routing_key, "未处理的路由键");
            return Ok(());
        }

        let feedback: FeedbackCreated = event.decode()?;

        match self
            .points
            .process_feedback_point(&feedback.user_id, feedback.feedback_id)
            .await
        {
            Ok(award) => {
                info!(
                    event_id = %event.event_id,
                    user_id = %feedback.user_id,
                    feedback_id = feedback.feedback_id,
                    total_points = award.balance.total_points,
                    "反馈积分已发放"
                );
                Ok(())
            }
            // 业务结果直接确认
            Err(e) if e.is_business_outcome() => {
                debug!(event_id = %event.event_id, reason = %e, "反馈未获得积分");
                Ok(())
            }
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    feedback_id = feedback.feedback_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "反馈事件处理失败"
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryPointLedger;
    use chrono::Utc;

    fn feedback_event(feedback_id: i64, user_id: &str) -> EventEnvelope {
        EventEnvelope::new(
            &FeedbackCreated {
                feedback_id,
                user_id: user_id.to_string(),
                rating: Some(5),
                created_at: Some(Utc::now()),
            },
            "feedback-service",
        )
        .unwrap()
    }

    fn handler() -> (FeedbackPointHandler, Arc<PointService>) {
        let service = Arc::new(PointService::new(Arc::new(MemoryPointLedger::new())));
        (FeedbackPointHandler::new(service.clone()), service)
    }

    #[test]
    fn test_binding_accepts_feedback_created_only() {
        let binding = feedback_binding();
        assert!(binding.accepts(exchanges::FEEDBACK, routing_keys::FEEDBACK_CREATED));
        assert!(!binding.accepts(exchanges::FEEDBACK, routing_keys::FEEDBACK_RESPONDED));
        assert!(!binding.accepts(exchanges::REWARD, routing_keys::REWARD_CLAIMED));
    }

    #[tokio::test]
    async fn test_second_feedback_same_day_is_acked() {
        let (handler, service) = handler();

        handler.handle(&feedback_event(1, "u-1")).await.unwrap();
        handler.handle(&feedback_event(2, "u-1")).await.unwrap();

        assert_eq!(service.get_balance("u-1").await.unwrap().total_points, 1);
    }

    #[tokio::test]
    async fn test_redelivered_feedback_is_acked_without_effect() {
        let (handler, service) = handler();
        let event = feedback_event(1, "u-1");

        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        assert_eq!(service.get_balance("u-1").await.unwrap().total_points, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let (handler, _) = handler();
        let mut event = feedback_event(1, "u-1");
        event.payload = serde_json::json!({ "feedback_id": "not-a-number" });

        let err = handler.handle(&event).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
