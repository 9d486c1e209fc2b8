//! 库存服务
//!
//! 库存台账：商品库存只通过带行锁的事务变动，每次变动追加一条不可变流水，
//! 并通过 outbox 发布 `inventory.stock_updated` / `inventory.low_stock`。
//! 同时消费奖励领取事件，把领取同步到关联商品。

pub mod consumer;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod routes;
pub mod service;
pub mod state;

pub use error::{InventoryError, Result};
pub use service::StockLedgerService;

pub const SERVICE_NAME: &str = "inventory-service";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
