//! 通知工作者
//!
//! 订阅奖励、反馈、文章和库存领域的事件，渲染为通知后通过多渠道发送器并行推送。
//! 各渠道独立发送，单个渠道失败不影响其他渠道的投递；全部渠道失败时消息重新投递。
//!
//! 全局唯一的死信重放消费者也运行在本进程中。

pub mod consumer;
pub mod error;
pub mod notification;
pub mod sender;
pub mod templates;

pub const SERVICE_NAME: &str = "notification-worker";
