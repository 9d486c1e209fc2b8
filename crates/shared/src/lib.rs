//! 共享库
//!
//! 包含所有积分/奖励服务共用的配置、错误处理、数据库连接、缓存、事件总线、
//! 发件箱、幂等消费与可观测性等基础设施代码。

pub mod bus;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod database;
pub mod dlq;
pub mod error;
pub mod events;
pub mod http;
pub mod idempotency;
pub mod internal_auth;
pub mod kafka;
pub mod observability;
pub mod outbox;
pub mod retry;
pub mod shutdown;
pub mod tier;
