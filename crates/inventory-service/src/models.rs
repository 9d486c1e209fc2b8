//! 库存台账领域模型

use std::fmt;

use chrono::{DateTime, Utc};
use loyalty_shared::error::LoyaltyError;
use loyalty_shared::events::{EventEnvelope, LowStock, StockUpdated};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{InventoryError, Result};

/// 领取记录在库存流水中的引用号
pub fn claim_reference(claim_id: i64) -> String {
    format!("claim:{claim_id}")
}

// ---------------------------------------------------------------------------
// 枚举
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockChangeType {
    Increase,
    Decrease,
}

impl StockChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Increase => "INCREASE",
            Self::Decrease => "DECREASE",
        }
    }
}

impl fmt::Display for StockChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// 库存商品
///
/// `current_stock` 只能通过台账变动修改，且不会小于 0。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: i64,
    pub name: String,
    pub sku: String,
    pub current_stock: i32,
    pub minimum_stock: i32,
    pub reorder_quantity: i32,
    pub active: bool,
    /// 关联奖励，领取该奖励时同步扣减本商品
    pub reward_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn is_low_stock(&self) -> bool {
        self.current_stock < self.minimum_stock
    }

    /// 计算变动后的库存，扣减不足时返回错误
    pub fn next_stock(&self, change_type: StockChangeType, quantity: i32) -> Result<i32> {
        match change_type {
            StockChangeType::Increase => self
                .current_stock
                .checked_add(quantity)
                .ok_or_else(|| InventoryError::Validation("库存数量溢出".to_string())),
            StockChangeType::Decrease if self.current_stock < quantity => {
                Err(InventoryError::InsufficientStock {
                    item_id: self.id,
                    available: self.current_stock,
                    requested: quantity,
                })
            }
            StockChangeType::Decrease => Ok(self.current_stock - quantity),
        }
    }

    pub fn low_stock_alert(&self) -> Option<LowStockAlert> {
        self.is_low_stock().then(|| LowStockAlert {
            item_id: self.id,
            name: self.name.clone(),
            sku: self.sku.clone(),
            current_stock: self.current_stock,
            minimum_stock: self.minimum_stock,
            deficit: self.minimum_stock - self.current_stock,
            reorder_quantity: self.reorder_quantity,
        })
    }
}

/// 新建商品
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    #[validate(length(min = 1, max = 200, message = "名称长度必须在 1-200 之间"))]
    pub name: String,
    #[validate(length(min = 1, max = 100, message = "SKU 长度必须在 1-100 之间"))]
    pub sku: String,
    #[serde(default)]
    #[validate(range(min = 0, message = "初始库存不能为负"))]
    pub current_stock: i32,
    #[serde(default)]
    #[validate(range(min = 0, message = "最低库存不能为负"))]
    pub minimum_stock: i32,
    #[serde(default)]
    #[validate(range(min = 0, message = "补货数量不能为负"))]
    pub reorder_quantity: i32,
    pub reward_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// StockTransaction
// ---------------------------------------------------------------------------

/// 不可变的库存流水
///
/// `new_qty = previous_qty ± quantity`，且等于提交时商品的 `current_stock`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StockTransaction {
    pub id: i64,
    pub item_id: i64,
    #[serde(rename = "type")]
    pub change_type: StockChangeType,
    pub quantity: i32,
    pub previous_qty: i32,
    pub new_qty: i32,
    pub reason: String,
    pub reference_id: Option<String>,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
}

impl StockTransaction {
    pub fn to_event(&self) -> StockUpdated {
        StockUpdated {
            transaction_id: self.id,
            item_id: self.item_id,
            change_type: self.change_type.as_str().to_string(),
            quantity: self.quantity,
            previous_qty: self.previous_qty,
            new_qty: self.new_qty,
            reason: self.reason.clone(),
            reference_id: self.reference_id.clone(),
            performed_by: self.performed_by.clone(),
            created_at: self.created_at,
        }
    }

    /// 库存增减的带符号数量
    pub fn signed_quantity(&self) -> i64 {
        match self.change_type {
            StockChangeType::Increase => i64::from(self.quantity),
            StockChangeType::Decrease => -i64::from(self.quantity),
        }
    }
}

/// 一次库存变动请求
#[derive(Debug, Clone, PartialEq)]
pub struct StockChange {
    pub item_id: i64,
    pub change_type: StockChangeType,
    pub quantity: i32,
    pub reason: String,
    pub reference_id: Option<String>,
    pub performed_by: String,
}

impl StockChange {
    pub fn new(
        item_id: i64,
        change_type: StockChangeType,
        quantity: i32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            item_id,
            change_type,
            quantity,
            reason: reason.into(),
            reference_id: None,
            performed_by: "system".to_string(),
        }
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn performed_by(mut self, operator: impl Into<String>) -> Self {
        self.performed_by = operator.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity <= 0 {
            return Err(InventoryError::Validation("数量必须大于0".to_string()));
        }
        if self.reason.trim().is_empty() {
            return Err(InventoryError::Validation("变动原因不能为空".to_string()));
        }
        Ok(())
    }
}

/// 管理端库存调整请求
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StockAdjustmentRequest {
    #[validate(range(min = 1, message = "数量必须大于0"))]
    pub quantity: i32,
    #[validate(length(min = 1, max = 500, message = "变动原因长度必须在 1-500 之间"))]
    pub reason: String,
    #[validate(length(max = 100, message = "引用号长度不能超过 100"))]
    pub reference_id: Option<String>,
    pub performed_by: Option<String>,
}

impl StockAdjustmentRequest {
    pub fn into_change(self, item_id: i64, change_type: StockChangeType) -> StockChange {
        StockChange {
            item_id,
            change_type,
            quantity: self.quantity,
            reason: self.reason,
            reference_id: self.reference_id,
            performed_by: self.performed_by.unwrap_or_else(|| "admin".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// 变动结果与低库存预警
// ---------------------------------------------------------------------------

/// 低库存预警
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStockAlert {
    pub item_id: i64,
    pub name: String,
    pub sku: String,
    pub current_stock: i32,
    pub minimum_stock: i32,
    pub deficit: i32,
    /// 建议补货数量
    pub reorder_quantity: i32,
}

impl LowStockAlert {
    pub fn to_event(&self) -> LowStock {
        LowStock {
            item_id: self.item_id,
            name: self.name.clone(),
            sku: self.sku.clone(),
            current_stock: self.current_stock,
            minimum_stock: self.minimum_stock,
            deficit: self.deficit,
            reorder_quantity: self.reorder_quantity,
        }
    }
}

/// 一次已提交的库存变动
#[derive(Debug, Clone)]
pub struct StockMutation {
    /// 变动后的商品
    pub item: Item,
    pub transaction: StockTransaction,
    /// 扣减后低于最低库存时产生
    pub low_stock: Option<LowStockAlert>,
}

impl StockMutation {
    pub fn new(item: Item, transaction: StockTransaction) -> Self {
        let low_stock = match transaction.change_type {
            StockChangeType::Decrease => item.low_stock_alert(),
            StockChangeType::Increase => None,
        };
        Self {
            item,
            transaction,
            low_stock,
        }
    }

    /// 与变动同事务写入 outbox 的事件
    pub fn events(&self, source: &str) -> std::result::Result<Vec<EventEnvelope>, LoyaltyError> {
        let mut events = vec![EventEnvelope::new(&self.transaction.to_event(), source)?];
        if let Some(alert) = &self.low_stock {
            events.push(EventEnvelope::new(&alert.to_event(), source)?);
        }
        Ok(events)
    }
}

/// 领取事件对库存的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimReconciliation {
    Applied(StockTransaction),
    /// 同一领取记录已处理过
    AlreadyApplied,
    /// 奖励没有关联的有效商品
    NotLinked,
    /// 没有可回补的扣减
    NothingToRestore,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn item(id: i64, current_stock: i32, minimum_stock: i32) -> Item {
        let now = Utc::now();
        Item {
            id,
            name: format!("Item {id}"),
            sku: format!("SKU-{id}"),
            current_stock,
            minimum_stock,
            reorder_quantity: 20,
            active: true,
            reward_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transaction(item: &Item, change_type: StockChangeType, quantity: i32) -> StockTransaction {
        let previous_qty = item.current_stock;
        let new_qty = match change_type {
            StockChangeType::Increase => previous_qty + quantity,
            StockChangeType::Decrease => previous_qty - quantity,
        };
        StockTransaction {
            id: 1,
            item_id: item.id,
            change_type,
            quantity,
            previous_qty,
            new_qty,
            reason: "test".to_string(),
            reference_id: None,
            performed_by: "tester".to_string(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use loyalty_shared::events::routing_keys;

    #[test]
    fn test_decrease_beyond_stock_is_rejected() {
        let item = item(1, 3, 0);
        assert_eq!(item.next_stock(StockChangeType::Decrease, 3).unwrap(), 0);
        assert!(matches!(
            item.next_stock(StockChangeType::Decrease, 4),
            Err(InventoryError::InsufficientStock {
                available: 3,
                requested: 4,
                ..
            })
        ));
        assert_eq!(item.next_stock(StockChangeType::Increase, 4).unwrap(), 7);
    }

    #[test]
    fn test_low_stock_alert_deficit() {
        let alert = item(1, 2, 10).low_stock_alert().unwrap();
        assert_eq!(alert.deficit, 8);
        assert_eq!(alert.reorder_quantity, 20);
        // 等于最低库存不算低库存
        assert!(item(1, 10, 10).low_stock_alert().is_none());
    }

    #[test]
    fn test_only_decrease_raises_low_stock() {
        let before = item(1, 5, 10);
        let mut after = before.clone();
        after.current_stock = 4;
        let mutation = StockMutation::new(
            after.clone(),
            transaction(&before, StockChangeType::Decrease, 1),
        );
        assert!(mutation.low_stock.is_some());

        let mutation = StockMutation::new(after, transaction(&before, StockChangeType::Increase, 1));
        assert!(mutation.low_stock.is_none());
    }

    #[test]
    fn test_mutation_events() {
        let before = item(1, 5, 10);
        let mut after = before.clone();
        after.current_stock = 3;
        let mutation = StockMutation::new(after, transaction(&before, StockChangeType::Decrease, 2));

        let events = mutation.events("inventory-service").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].routing_key, routing_keys::STOCK_UPDATED);
        assert_eq!(events[0].payload["type"], "DECREASE");
        assert_eq!(events[0].payload["new_qty"], 3);
        assert_eq!(events[1].routing_key, routing_keys::LOW_STOCK);
        assert_eq!(events[1].payload["deficit"], 7);
    }

    #[test]
    fn test_stock_change_validation() {
        assert!(StockChange::new(1, StockChangeType::Increase, 0, "restock")
            .validate()
            .is_err());
        assert!(StockChange::new(1, StockChangeType::Increase, 1, "  ")
            .validate()
            .is_err());
        assert!(StockChange::new(1, StockChangeType::Decrease, 1, "sold")
            .validate()
            .is_ok());
    }
}
