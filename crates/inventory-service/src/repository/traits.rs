//! 仓储 Trait 定义

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Item, NewItem, StockChange, StockChangeType, StockMutation, StockTransaction};

/// 库存台账仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StockLedgerRepository: Send + Sync {
    // 商品
    async fn get_item(&self, id: i64) -> Result<Option<Item>>;
    async fn find_item_by_reward(&self, reward_id: i64) -> Result<Option<Item>>;
    async fn create_item(&self, item: &NewItem) -> Result<Item>;
    /// 启用且低于最低库存的商品
    async fn list_low_stock(&self) -> Result<Vec<Item>>;

    // 流水
    /// 按时间倒序分页，返回 (当页记录, 总数)
    async fn list_transactions(
        &self,
        item_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StockTransaction>, i64)>;
    async fn find_transaction_by_reference(
        &self,
        item_id: i64,
        reference_id: &str,
        change_type: StockChangeType,
    ) -> Result<Option<StockTransaction>>;

    /// 原子地修改库存、追加流水并写入 outbox 事件
    async fn apply_change(&self, change: &StockChange) -> Result<StockMutation>;
}
