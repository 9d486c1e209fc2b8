//! 库存台账仓储
//!
//! - 库存列和流水在同一事务中写入，商品行用 `FOR UPDATE` 加锁
//! - 变动产生的事件与变动同事务写入 outbox
//! - 内存实现用于测试和跨服务编排测试

mod item_repo;
mod memory;
mod traits;

pub use item_repo::ItemRepository;
pub use memory::MemoryStockLedger;
pub use traits::*;
