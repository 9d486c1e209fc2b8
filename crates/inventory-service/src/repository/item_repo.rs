//! 商品与库存流水仓储（PostgreSQL）

use async_trait::async_trait;
use loyalty_shared::outbox::PgOutbox;
use sqlx::{PgConnection, PgPool};
use tracing::instrument;

use super::traits::StockLedgerRepository;
use crate::SERVICE_NAME;
use crate::error::{InventoryError, Result};
use crate::models::{Item, NewItem, StockChange, StockChangeType, StockMutation, StockTransaction};

pub struct ItemRepository {
    pool: PgPool,
}

impl ItemRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在事务中锁定商品行
    pub async fn lock_item_in_tx(conn: &mut PgConnection, id: i64) -> Result<Option<Item>> {
        let item = sqlx::query_as::<_, Item>(
            r#"
            SELECT id, name, sku, current_stock, minimum_stock, reorder_quantity,
                   active, reward_id, created_at, updated_at
            FROM items
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;

        Ok(item)
    }

    /// 在事务中追加库存流水
    pub async fn insert_transaction_in_tx(
        conn: &mut PgConnection,
        change: &StockChange,
        previous_qty: i32,
        new_qty: i32,
    ) -> Result<StockTransaction> {
        sqlx::query_as::<_, StockTransaction>(
            r#"
            INSERT INTO stock_transactions
                (item_id, change_type, quantity, previous_qty, new_qty, reason, reference_id, performed_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, item_id, change_type, quantity, previous_qty, new_qty,
                      reason, reference_id, performed_by, created_at
            "#,
        )
        .bind(change.item_id)
        .bind(change.change_type)
        .bind(change.quantity)
        .bind(previous_qty)
        .bind(new_qty)
        .bind(&change.reason)
        .bind(&change.reference_id)
        .bind(&change.performed_by)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            InventoryError::from_unique_violation(e, |_| InventoryError::DuplicateReference {
                item_id: change.item_id,
                reference_id: change.reference_id.clone().unwrap_or_default(),
            })
        })
    }
}

#[async_trait]
impl StockLedgerRepository for ItemRepository {
    async fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let item = sqlx::query_as::<_, Item>(
            r#"
            SELECT id, name, sku, current_stock, minimum_stock, reorder_quantity,
                   active, reward_id, created_at, updated_at
            FROM items
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn find_item_by_reward(&self, reward_id: i64) -> Result<Option<Item>> {
        let item = sqlx::query_as::<_, Item>(
            r#"
            SELECT id, name, sku, current_stock, minimum_stock, reorder_quantity,
                   active, reward_id, created_at, updated_at
            FROM items
            WHERE reward_id = $1 AND active
            "#,
        )
        .bind(reward_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn create_item(&self, item: &NewItem) -> Result<Item> {
        sqlx::query_as::<_, Item>(
            r#"
            INSERT INTO items (name, sku, current_stock, minimum_stock, reorder_quantity, reward_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, sku, current_stock, minimum_stock, reorder_quantity,
                      active, reward_id, created_at, updated_at
            "#,
        )
        .bind(&item.name)
        .bind(&item.sku)
        .bind(item.current_stock)
        .bind(item.minimum_stock)
        .bind(item.reorder_quantity)
        .bind(item.reward_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            InventoryError::from_unique_violation(e, |constraint| {
                if constraint.contains("reward") {
                    InventoryError::Validation(format!(
                        "奖励 {} 已关联其他商品",
                        item.reward_id.unwrap_or_default()
                    ))
                } else {
                    InventoryError::DuplicateSku(item.sku.clone())
                }
            })
        })
    }

    async fn list_low_stock(&self) -> Result<Vec<Item>> {
        let items = sqlx::query_as::<_, Item>(
            r#"
            SELECT id, name, sku, current_stock, minimum_stock, reorder_quantity,
                   active, reward_id, created_at, updated_at
            FROM items
            WHERE active AND current_stock < minimum_stock
            ORDER BY (minimum_stock - current_stock) DESC, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn list_transactions(
        &self,
        item_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StockTransaction>, i64)> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stock_transactions WHERE item_id = $1")
                .bind(item_id)
                .fetch_one(&self.pool)
                .await?;

        let transactions = sqlx::query_as::<_, StockTransaction>(
            r#"
            SELECT id, item_id, change_type, quantity, previous_qty, new_qty,
                   reason, reference_id, performed_by, created_at
            FROM stock_transactions
            WHERE item_id = $1
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(item_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((transactions, total))
    }

    async fn find_transaction_by_reference(
        &self,
        item_id: i64,
        reference_id: &str,
        change_type: StockChangeType,
    ) -> Result<Option<StockTransaction>> {
        let transaction = sqlx::query_as::<_, StockTransaction>(
            r#"
            SELECT id, item_id, change_type, quantity, previous_qty, new_qty,
                   reason, reference_id, performed_by, created_at
            FROM stock_transactions
            WHERE item_id = $1 AND reference_id = $2 AND change_type = $3
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(item_id)
        .bind(reference_id)
        .bind(change_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(transaction)
    }

    #[instrument(skip(self, change), fields(item_id = change.item_id, change_type = %change.change_type))]
    async fn apply_change(&self, change: &StockChange) -> Result<StockMutation> {
        let mut tx = self.pool.begin().await?;

        // 行锁覆盖读-改-写，并发扣减不会同时通过库存校验
        let item = Self::lock_item_in_tx(&mut tx, change.item_id)
            .await?
            .ok_or(InventoryError::ItemNotFound(change.item_id))?;

        let previous_qty = item.current_stock;
        let new_qty = item.next_stock(change.change_type, change.quantity)?;

        let item = sqlx::query_as::<_, Item>(
            r#"
            UPDATE items
            SET current_stock = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, sku, current_stock, minimum_stock, reorder_quantity,
                      active, reward_id, created_at, updated_at
            "#,
        )
        .bind(change.item_id)
        .bind(new_qty)
        .fetch_one(&mut *tx)
        .await?;

        let transaction =
            Self::insert_transaction_in_tx(&mut tx, change, previous_qty, new_qty).await?;

        let mutation = StockMutation::new(item, transaction);
        for envelope in mutation.events(SERVICE_NAME)? {
            PgOutbox::enqueue_in_tx(&mut tx, &envelope).await?;
        }

        tx.commit().await?;
        Ok(mutation)
    }
}
