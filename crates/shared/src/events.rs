//! 领域事件契约
//!
//! 定义跨服务传递的统一事件信封、交换机与路由键常量，以及各路由键对应的
//! 负载结构。负载字段名是服务间的线上契约，统一使用 snake_case。

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LoyaltyError;
use crate::observability::tracing::current_trace_id;

// ---------------------------------------------------------------------------
// 交换机与路由键
// ---------------------------------------------------------------------------

/// 按领域划分的 topic 交换机
pub mod exchanges {
    pub const REWARD: &str = "reward.events";
    pub const INVENTORY: &str = "inventory.events";
    pub const FEEDBACK: &str = "feedback.events";
    pub const ARTICLE: &str = "article.events";
}

/// 路由键
pub mod routing_keys {
    pub const REWARD_CLAIMED: &str = "reward.claimed";
    pub const CLAIM_STATUS_UPDATED: &str = "reward.claim_status_updated";
    pub const STOCK_UPDATED: &str = "inventory.stock_updated";
    pub const LOW_STOCK: &str = "inventory.low_stock";
    pub const FEEDBACK_CREATED: &str = "feedback.created";
    pub const FEEDBACK_RESPONDED: &str = "feedback.responded";
    pub const ARTICLE_CREATED: &str = "article.created";
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// 领域事件负载
///
/// 每种负载类型固定绑定一个交换机和路由键，发布时据此路由。
pub trait DomainEvent: Serialize + DeserializeOwned {
    const EXCHANGE: &'static str;
    const ROUTING_KEY: &'static str;

    /// 聚合根 ID，用作消息分区键，保证同一聚合的事件有序
    fn aggregate_id(&self) -> String;
}

// ---------------------------------------------------------------------------
// EventEnvelope
// ---------------------------------------------------------------------------

/// 事件信封
///
/// `event_id` 使用 UUID v7，消费端据此做幂等去重；
/// `trace_id` 串联发布方的追踪上下文。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    /// 发布服务名
    pub source: String,
    pub trace_id: Option<String>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// 包装领域事件，生成新的 event_id 并记录当前追踪上下文
    pub fn new<E: DomainEvent>(event: &E, source: impl Into<String>) -> Result<Self, LoyaltyError> {
        Ok(Self {
            event_id: Uuid::now_v7().to_string(),
            exchange: E::EXCHANGE.to_string(),
            routing_key: E::ROUTING_KEY.to_string(),
            aggregate_id: event.aggregate_id(),
            occurred_at: Utc::now(),
            source: source.into(),
            trace_id: current_trace_id(),
            payload: serde_json::to_value(event)?,
        })
    }

    /// 是否为指定类型的事件
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.exchange == E::EXCHANGE && self.routing_key == E::ROUTING_KEY
    }

    /// 解码为指定类型的负载
    ///
    /// 路由键不匹配或负载结构不合法均返回错误，二者都不可重试。
    pub fn decode<E: DomainEvent>(&self) -> Result<E, LoyaltyError> {
        if !self.is::<E>() {
            return Err(LoyaltyError::EventMismatch(format!(
                "期望 {}/{}, 实际 {}/{}",
                E::EXCHANGE,
                E::ROUTING_KEY,
                self.exchange,
                self.routing_key
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoyaltyError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoyaltyError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// reward.events
// ---------------------------------------------------------------------------

/// 奖励领取成功
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardClaimed {
    pub claim_id: i64,
    pub user_id: String,
    pub reward_id: i64,
    /// 领取时快照的积分成本
    pub points: i64,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for RewardClaimed {
    const EXCHANGE: &'static str = exchanges::REWARD;
    const ROUTING_KEY: &'static str = routing_keys::REWARD_CLAIMED;

    fn aggregate_id(&self) -> String {
        format!("claim:{}", self.claim_id)
    }
}

/// 领取记录状态变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimStatusUpdated {
    pub claim_id: i64,
    pub user_id: String,
    pub reward_id: i64,
    /// PENDING / APPROVED / REJECTED / CANCELLED
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl ClaimStatusUpdated {
    /// 状态是否为释放库存的终态
    pub fn releases_stock(&self) -> bool {
        matches!(self.status.as_str(), "REJECTED" | "CANCELLED")
    }
}

impl DomainEvent for ClaimStatusUpdated {
    const EXCHANGE: &'static str = exchanges::REWARD;
    const ROUTING_KEY: &'static str = routing_keys::CLAIM_STATUS_UPDATED;

    fn aggregate_id(&self) -> String {
        format!("claim:{}", self.claim_id)
    }
}

// ---------------------------------------------------------------------------
// inventory.events
// ---------------------------------------------------------------------------

/// 库存变动
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockUpdated {
    pub transaction_id: i64,
    pub item_id: i64,
    /// INCREASE / DECREASE
    #[serde(rename = "type")]
    pub change_type: String,
    pub quantity: i32,
    pub previous_qty: i32,
    pub new_qty: i32,
    pub reason: String,
    pub reference_id: Option<String>,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for StockUpdated {
    const EXCHANGE: &'static str = exchanges::INVENTORY;
    const ROUTING_KEY: &'static str = routing_keys::STOCK_UPDATED;

    fn aggregate_id(&self) -> String {
        format!("item:{}", self.item_id)
    }
}

/// 低库存预警
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStock {
    pub item_id: i64,
    pub name: String,
    pub sku: String,
    pub current_stock: i32,
    pub minimum_stock: i32,
    pub deficit: i32,
    pub reorder_quantity: i32,
}

impl DomainEvent for LowStock {
    const EXCHANGE: &'static str = exchanges::INVENTORY;
    const ROUTING_KEY: &'static str = routing_keys::LOW_STOCK;

    fn aggregate_id(&self) -> String {
        format!("item:{}", self.item_id)
    }
}

// ---------------------------------------------------------------------------
// feedback.events / article.events
// ---------------------------------------------------------------------------

/// 用户提交反馈
///
/// 反馈服务可能附带更多字段，这里只解析积分发放需要的部分。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCreated {
    pub feedback_id: i64,
    pub user_id: String,
    #[serde(default)]
    pub rating: Option<i32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl DomainEvent for FeedbackCreated {
    const EXCHANGE: &'static str = exchanges::FEEDBACK;
    const ROUTING_KEY: &'static str = routing_keys::FEEDBACK_CREATED;

    fn aggregate_id(&self) -> String {
        format!("feedback:{}", self.feedback_id)
    }
}

/// 管理员回复反馈
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackResponded {
    pub feedback_id: i64,
    pub user_id: String,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

impl DomainEvent for FeedbackResponded {
    const EXCHANGE: &'static str = exchanges::FEEDBACK;
    const ROUTING_KEY: &'static str = routing_keys::FEEDBACK_RESPONDED;

    fn aggregate_id(&self) -> String {
        format!("feedback:{}", self.feedback_id)
    }
}

/// 文章发布
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleCreated {
    pub article_id: i64,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl DomainEvent for ArticleCreated {
    const EXCHANGE: &'static str = exchanges::ARTICLE;
    const ROUTING_KEY: &'static str = routing_keys::ARTICLE_CREATED;

    fn aggregate_id(&self) -> String {
        format!("article:{}", self.article_id)
    }
}
