//! 通知模板
//!
//! 根据通知类型生成标题和正文。模板硬编码在代码中，
//! 字段取自事件负载，缺失字段使用占位符。

use crate::notification::NotificationType;

/// 通知模板引擎
pub struct NotificationTemplateEngine;

impl NotificationTemplateEngine {
    /// 渲染标题
    ///
    /// 除领取状态外标题固定，便于客户端聚合展示同类通知
    pub fn render_title(notification_type: &NotificationType, data: &serde_json::Value) -> String {
        match notification_type {
            NotificationType::RewardClaimed => "奖励领取申请已提交".to_string(),
            NotificationType::ClaimStatusUpdated => {
                match extract_str(data, "status", "").as_str() {
                    "APPROVED" => "奖励领取已通过".to_string(),
                    "REJECTED" => "奖励领取未通过".to_string(),
                    "CANCELLED" => "奖励领取已取消".to_string(),
                    _ => "奖励领取状态更新".to_string(),
                }
            }
            NotificationType::FeedbackResponded => "您的反馈有了新回复".to_string(),
            NotificationType::ArticlePublished => "新文章发布".to_string(),
            NotificationType::LowStock => "库存预警".to_string(),
        }
    }

    /// 渲染正文
    pub fn render_body(notification_type: &NotificationType, data: &serde_json::Value) -> String {
        match notification_type {
            NotificationType::RewardClaimed => {
                let claim_id = extract_str(data, "claim_id", "?");
                let points = extract_str(data, "points", "?");
                format!("您的领取申请 #{claim_id} 已提交（积分门槛 {points}），请等待审核")
            }
            NotificationType::ClaimStatusUpdated => {
                let claim_id = extract_str(data, "claim_id", "?");
                let status = extract_str(data, "status", "未知状态");
                format!("您的领取申请 #{claim_id} 当前状态：{status}")
            }
            NotificationType::FeedbackResponded => {
                let feedback_id = extract_str(data, "feedback_id", "?");
                match data.get("response").and_then(|v| v.as_str()) {
                    Some(response) => format!("反馈 #{feedback_id} 的回复：{response}"),
                    None => format!("反馈 #{feedback_id} 已有回复，请前往查看"),
                }
            }
            NotificationType::ArticlePublished => {
                let title = extract_str(data, "title", "未命名文章");
                match data.get("author").and_then(|v| v.as_str()) {
                    Some(author) => format!("{author} 发布了新文章「{title}」"),
                    None => format!("新文章「{title}」已发布"),
                }
            }
            NotificationType::LowStock => {
                let name = extract_str(data, "name", "未知物品");
                let sku = extract_str(data, "sku", "?");
                let current = extract_str(data, "current_stock", "?");
                let minimum = extract_str(data, "minimum_stock", "?");
                let reorder = extract_str(data, "reorder_quantity", "?");
                format!(
                    "物品「{name}」({sku}) 库存 {current} 低于最低库存 {minimum}，建议补货 {reorder}"
                )
            }
        }
    }
}

/// 从 JSON 对象中提取字符串值，数值等类型按 JSON 文本渲染
fn extract_str(data: &serde_json::Value, key: &str, default: &str) -> String {
    data.get(key)
        .filter(|v| !v.is_null())
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| default.to_string())
}
