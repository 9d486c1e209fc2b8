//! 领取事件消费者
//!
//! 队列 `inventory.reward-claims` 绑定 `reward.events` 上的领取与状态变更事件，
//! 把领取记录同步到关联商品的库存台账。

use std::sync::Arc;

use async_trait::async_trait;
use loyalty_shared::bus::{EventHandler, HandlerError, QueueBinding};
use loyalty_shared::events::{ClaimStatusUpdated, EventEnvelope, RewardClaimed, exchanges, routing_keys};
use tracing::{debug, info, warn};

use crate::error::InventoryError;
use crate::models::ClaimReconciliation;
use crate::service::StockLedgerService;

pub const REWARD_CLAIMS_QUEUE: &str = "inventory.reward-claims";

pub fn reward_claims_binding() -> QueueBinding {
    QueueBinding::new(REWARD_CLAIMS_QUEUE, exchanges::REWARD)
        .bind(routing_keys::REWARD_CLAIMED)
        .bind(routing_keys::CLAIM_STATUS_UPDATED)
}

impl From<InventoryError> for HandlerError {
    fn from(err: InventoryError) -> Self {
        if err.is_retryable() {
            HandlerError::Retryable(err.to_string())
        } else {
            HandlerError::Rejected(err.to_string())
        }
    }
}

pub struct RewardClaimHandler {
    ledger: Arc<StockLedgerService>,
}

impl RewardClaimHandler {
    pub fn new(ledger: Arc<StockLedgerService>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl EventHandler for RewardClaimHandler {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let outcome = if event.is::<RewardClaimed>() {
            let claim: RewardClaimed = event.decode()?;
            self.ledger.reconcile_claim(&claim).await
        } else if event.is::<ClaimStatusUpdated>() {
            let update: ClaimStatusUpdated = event.decode()?;
            self.ledger.restore_claim(&update).await
        } else {
            debug!(routing_key = %event.routing_key, "未处理的路由键");
            return Ok(());
        };

        match outcome {
            Ok(ClaimReconciliation::Applied(tx)) => {
                info!(
                    event_id = %event.event_id,
                    aggregate_id = %event.aggregate_id,
                    item_id = tx.item_id,
                    change_type = %tx.change_type,
                    new_qty = tx.new_qty,
                    "领取事件已同步库存"
                );
                Ok(())
            }
            Ok(other) => {
                debug!(event_id = %event.event_id, outcome = ?other, "领取事件无需变动库存");
                Ok(())
            }
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    routing_key = %event.routing_key,
                    error = %e,
                    retryable = e.is_retryable(),
                    "领取事件处理失败"
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_accepts_claim_events_only() {
        let binding = reward_claims_binding();
        assert!(binding.accepts(exchanges::REWARD, routing_keys::REWARD_CLAIMED));
        assert!(binding.accepts(exchanges::REWARD, routing_keys::CLAIM_STATUS_UPDATED));
        assert!(!binding.accepts(exchanges::INVENTORY, routing_keys::STOCK_UPDATED));
        assert!(!binding.accepts(exchanges::FEEDBACK, routing_keys::FEEDBACK_CREATED));
    }

    #[test]
    fn test_business_errors_are_rejected() {
        let err: HandlerError = InventoryError::InsufficientStock {
            item_id: 1,
            available: 0,
            requested: 1,
        }
        .into();
        assert!(!err.is_retryable());

        let err: HandlerError = InventoryError::Database(sqlx::Error::PoolTimedOut).into();
        assert!(err.is_retryable());
    }
}
