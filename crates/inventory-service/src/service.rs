//! 库存台账服务
//!
//! 管理端的增减库存、低库存报表，以及领取事件驱动的库存扣减与回补。
//! 领取驱动的变动以 `claim:<id>` 为引用号，重复事件不会重复扣减。

use std::sync::Arc;

use loyalty_shared::events::{ClaimStatusUpdated, RewardClaimed};
use loyalty_shared::http::{PageResponse, PaginationParams};
use loyalty_shared::observability::metrics;
use tracing::{debug, info, instrument, warn};

use crate::error::{InventoryError, Result};
use crate::models::{
    ClaimReconciliation, Item, LowStockAlert, NewItem, StockAdjustmentRequest, StockChange,
    StockChangeType, StockMutation, StockTransaction, claim_reference,
};
use crate::repository::StockLedgerRepository;

pub struct StockLedgerService {
    repo: Arc<dyn StockLedgerRepository>,
}

impl StockLedgerService {
    pub fn new(repo: Arc<dyn StockLedgerRepository>) -> Self {
        Self { repo }
    }

    // ---- 管理端操作 ----

    pub async fn increase_stock(
        &self,
        item_id: i64,
        request: StockAdjustmentRequest,
    ) -> Result<StockTransaction> {
        let mutation = self
            .apply(request.into_change(item_id, StockChangeType::Increase))
            .await?;
        Ok(mutation.transaction)
    }

    pub async fn decrease_stock(
        &self,
        item_id: i64,
        request: StockAdjustmentRequest,
    ) -> Result<StockTransaction> {
        let mutation = self
            .apply(request.into_change(item_id, StockChangeType::Decrease))
            .await?;
        Ok(mutation.transaction)
    }

    pub async fn create_item(&self, item: NewItem) -> Result<Item> {
        let item = self.repo.create_item(&item).await?;
        info!(item_id = item.id, sku = %item.sku, reward_id = ?item.reward_id, "商品已创建");
        Ok(item)
    }

    pub async fn get_item(&self, item_id: i64) -> Result<Item> {
        self.repo
            .get_item(item_id)
            .await?
            .ok_or(InventoryError::ItemNotFound(item_id))
    }

    /// 低库存报表，缺口大的排在前面
    pub async fn low_stock_report(&self) -> Result<Vec<LowStockAlert>> {
        let items = self.repo.list_low_stock().await?;
        Ok(items.iter().filter_map(Item::low_stock_alert).collect())
    }

    pub async fn list_transactions(
        &self,
        item_id: i64,
        pagination: &PaginationParams,
    ) -> Result<PageResponse<StockTransaction>> {
        self.get_item(item_id).await?;

        let (items, total) = self
            .repo
            .list_transactions(item_id, pagination.limit(), pagination.offset())
            .await?;
        Ok(PageResponse::new(
            items,
            total,
            pagination.page.max(1),
            pagination.limit(),
        ))
    }

    // ---- 领取事件 ----

    /// 领取成功后扣减关联商品 1 件
    #[instrument(skip(self, claim), fields(claim_id = claim.claim_id, reward_id = claim.reward_id))]
    pub async fn reconcile_claim(&self, claim: &RewardClaimed) -> Result<ClaimReconciliation> {
        let Some(item) = self.repo.find_item_by_reward(claim.reward_id).await? else {
            debug!("奖励未关联商品，跳过");
            return Ok(ClaimReconciliation::NotLinked);
        };

        let reference = claim_reference(claim.claim_id);
        if self
            .repo
            .find_transaction_by_reference(item.id, &reference, StockChangeType::Decrease)
            .await?
            .is_some()
        {
            debug!(item_id = item.id, "领取已扣减过库存");
            return Ok(ClaimReconciliation::AlreadyApplied);
        }

        let change = StockChange::new(
            item.id,
            StockChangeType::Decrease,
            1,
            format!("奖励领取 #{}", claim.claim_id),
        )
        .with_reference(reference)
        .performed_by(format!("user:{}", claim.user_id));

        match self.apply(change).await {
            Ok(mutation) => Ok(ClaimReconciliation::Applied(mutation.transaction)),
            Err(InventoryError::DuplicateReference { .. }) => {
                Ok(ClaimReconciliation::AlreadyApplied)
            }
            Err(e) => Err(e),
        }
    }

    /// 领取被拒绝或取消后回补已扣减的库存
    #[instrument(skip(self, update), fields(claim_id = update.claim_id, status = %update.status))]
    pub async fn restore_claim(&self, update: &ClaimStatusUpdated) -> Result<ClaimReconciliation> {
        if !update.releases_stock() {
            return Ok(ClaimReconciliation::NothingToRestore);
        }

        let Some(item) = self.repo.find_item_by_reward(update.reward_id).await? else {
            return Ok(ClaimReconciliation::NotLinked);
        };

        let reference = claim_reference(update.claim_id);
        let decreased = self
            .repo
            .find_transaction_by_reference(item.id, &reference, StockChangeType::Decrease)
            .await?;
        if decreased.is_none() {
            debug!(item_id = item.id, "领取未扣减过库存，无需回补");
            return Ok(ClaimReconciliation::NothingToRestore);
        }

        if self
            .repo
            .find_transaction_by_reference(item.id, &reference, StockChangeType::Increase)
            .await?
            .is_some()
        {
            return Ok(ClaimReconciliation::AlreadyApplied);
        }

        let change = StockChange::new(
            item.id,
            StockChangeType::Increase,
            1,
            format!("领取 #{} {}，回补库存", update.claim_id, update.status),
        )
        .with_reference(reference);

        match self.apply(change).await {
            Ok(mutation) => Ok(ClaimReconciliation::Applied(mutation.transaction)),
            Err(InventoryError::DuplicateReference { .. }) => {
                Ok(ClaimReconciliation::AlreadyApplied)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, change: StockChange) -> Result<StockMutation> {
        change.validate()?;

        let result = self.repo.apply_change(&change).await;
        let change_type = change.change_type.as_str();

        match &result {
            Ok(mutation) => {
                metrics::record_stock_mutation(change_type, "success");
                info!(
                    item_id = change.item_id,
                    change_type,
                    quantity = change.quantity,
                    previous_qty = mutation.transaction.previous_qty,
                    new_qty = mutation.transaction.new_qty,
                    reference_id = ?change.reference_id,
                    "库存已变动"
                );
                if let Some(alert) = &mutation.low_stock {
                    metrics::record_low_stock_alert();
                    warn!(
                        item_id = alert.item_id,
                        sku = %alert.sku,
                        current_stock = alert.current_stock,
                        minimum_stock = alert.minimum_stock,
                        deficit = alert.deficit,
                        "库存低于最低库存"
                    );
                }
            }
            Err(e) => {
                metrics::record_stock_mutation(change_type, e.error_code());
            }
        }

        result
    }
}
