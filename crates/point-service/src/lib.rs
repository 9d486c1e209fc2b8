//! 积分服务
//!
//! 积分台账：反馈驱动的积分获取（每日一次、每年重置）、等级计算，
//! 以及供奖励服务调用的内部余额查询接口。

pub mod consumer;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod routes;
pub mod service;
pub mod state;

pub use error::{PointError, Result};
pub use service::PointService;

pub const SERVICE_NAME: &str = "point-service";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
