//! 奖励领取服务
//!
//! 领取生命周期：同步查询积分门槛，在一个事务内写入领取记录、
//! 调整奖励库存并把 `reward.claimed` / `reward.claim_status_updated`
//! 写入 outbox，由后台中继投递到事件总线。

pub mod client;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod routes;
pub mod service;
pub mod state;

pub use error::{ClaimError, Result};
pub use service::ClaimService;

pub const SERVICE_NAME: &str = "reward-service";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
