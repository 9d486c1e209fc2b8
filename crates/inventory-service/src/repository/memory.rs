//! 内存库存台账
//!
//! 一把锁覆盖整个读-改-写，与数据库行锁语义一致。事件写入共享的内存 outbox。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use loyalty_shared::outbox::MemoryOutbox;
use parking_lot::Mutex;

use super::traits::StockLedgerRepository;
use crate::SERVICE_NAME;
use crate::error::{InventoryError, Result};
use crate::models::{Item, NewItem, StockChange, StockChangeType, StockMutation, StockTransaction};

#[derive(Default)]
struct State {
    items: BTreeMap<i64, Item>,
    transactions: Vec<StockTransaction>,
    next_item_id: i64,
    next_transaction_id: i64,
}

pub struct MemoryStockLedger {
    state: Mutex<State>,
    outbox: Arc<MemoryOutbox>,
}

impl MemoryStockLedger {
    pub fn new(outbox: Arc<MemoryOutbox>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Arc<MemoryOutbox> {
        &self.outbox
    }

    /// 商品全部流水，按写入顺序
    pub fn transactions(&self, item_id: i64) -> Vec<StockTransaction> {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn set_active(&self, item_id: i64, active: bool) {
        if let Some(item) = self.state.lock().items.get_mut(&item_id) {
            item.active = active;
        }
    }
}

#[async_trait]
impl StockLedgerRepository for MemoryStockLedger {
    async fn get_item(&self, id: i64) -> Result<Option<Item>> {
        Ok(self.state.lock().items.get(&id).cloned())
    }

    async fn find_item_by_reward(&self, reward_id: i64) -> Result<Option<Item>> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .find(|item| item.active && item.reward_id == Some(reward_id))
            .cloned())
    }

    async fn create_item(&self, new_item: &NewItem) -> Result<Item> {
        let mut state = self.state.lock();
        if state.items.values().any(|i| i.sku == new_item.sku) {
            return Err(InventoryError::DuplicateSku(new_item.sku.clone()));
        }
        if let Some(reward_id) = new_item.reward_id
            && state.items.values().any(|i| i.reward_id == Some(reward_id))
        {
            return Err(InventoryError::Validation(format!(
                "奖励 {reward_id} 已关联其他商品"
            )));
        }

        state.next_item_id += 1;
        let now = Utc::now();
        let item = Item {
            id: state.next_item_id,
            name: new_item.name.clone(),
            sku: new_item.sku.clone(),
            current_stock: new_item.current_stock,
            minimum_stock: new_item.minimum_stock,
            reorder_quantity: new_item.reorder_quantity,
            active: true,
            reward_id: new_item.reward_id,
            created_at: now,
            updated_at: now,
        };
        state.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn list_low_stock(&self) -> Result<Vec<Item>> {
        let mut items: Vec<Item> = self
            .state
            .lock()
            .items
            .values()
            .filter(|i| i.active && i.is_low_stock())
            .cloned()
            .collect();
        items.sort_by_key(|i| (std::cmp::Reverse(i.minimum_stock - i.current_stock), i.id));
        Ok(items)
    }

    async fn list_transactions(
        &self,
        item_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StockTransaction>, i64)> {
        let all = self.transactions(item_id);
        let total = all.len() as i64;
        let page = all
            .into_iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn find_transaction_by_reference(
        &self,
        item_id: i64,
        reference_id: &str,
        change_type: StockChangeType,
    ) -> Result<Option<StockTransaction>> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .find(|t| {
                t.item_id == item_id
                    && t.change_type == change_type
                    && t.reference_id.as_deref() == Some(reference_id)
            })
            .cloned())
    }

    async fn apply_change(&self, change: &StockChange) -> Result<StockMutation> {
        let mut state = self.state.lock();

        let item = state
            .items
            .get(&change.item_id)
            .cloned()
            .ok_or(InventoryError::ItemNotFound(change.item_id))?;

        if let Some(reference_id) = change
            .reference_id
            .as_deref()
            .filter(|r| r.starts_with("claim:"))
        {
            let duplicate = state.transactions.iter().any(|t| {
                t.item_id == change.item_id
                    && t.change_type == change.change_type
                    && t.reference_id.as_deref() == Some(reference_id)
            });
            if duplicate {
                return Err(InventoryError::DuplicateReference {
                    item_id: change.item_id,
                    reference_id: reference_id.to_string(),
                });
            }
        }

        let previous_qty = item.current_stock;
        let new_qty = item.next_stock(change.change_type, change.quantity)?;
        let now = Utc::now();

        let mut updated = item;
        updated.current_stock = new_qty;
        updated.updated_at = now;

        let transaction = StockTransaction {
            id: state.next_transaction_id + 1,
            item_id: change.item_id,
            change_type: change.change_type,
            quantity: change.quantity,
            previous_qty,
            new_qty,
            reason: change.reason.clone(),
            reference_id: change.reference_id.clone(),
            performed_by: change.performed_by.clone(),
            created_at: now,
        };

        let mutation = StockMutation::new(updated.clone(), transaction.clone());
        let events = mutation.events(SERVICE_NAME)?;
        // 变更事件和低库存预警一起写入，失败时库存和流水保持原样
        self.outbox.enqueue_all(&events)?;

        state.next_transaction_id = transaction.id;
        state.items.insert(updated.id, updated);
        state.transactions.push(transaction);

        Ok(mutation)
    }
}
