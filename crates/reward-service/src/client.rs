//! 积分余额客户端
//!
//! 领取前同步查询积分服务的内部接口 `GET /api/users/customer/{id}/points`。
//! HTTP 实现携带内部 API Key 和 W3C trace context，受超时和熔断器保护。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use loyalty_shared::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use loyalty_shared::config::PointClientConfig;
use loyalty_shared::http::ApiResponse;
use loyalty_shared::internal_auth::API_KEY_HEADER;
use loyalty_shared::observability::tracing::inject_to_headers;
use parking_lot::Mutex;
use reqwest::Url;
use tracing::{debug, instrument};

use crate::error::{ClaimError, Result};
use crate::models::PointBalanceView;

pub const POINT_SERVICE: &str = "point-service";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PointBalanceClient: Send + Sync {
    async fn get_balance(&self, user_id: &str) -> Result<PointBalanceView>;
}

// ---------------------------------------------------------------------------
// HTTP 实现
// ---------------------------------------------------------------------------

pub struct HttpPointClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    breaker: CircuitBreaker,
}

impl HttpPointClient {
    pub fn new(config: &PointClientConfig, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ClaimError::Internal(format!("构建 HTTP 客户端失败: {e}")))?;
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ClaimError::Internal(format!("积分服务地址无效 {}: {e}", config.base_url))
        })?;

        Ok(Self {
            http,
            base_url,
            api_key,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::for_point_client(config)),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 用户 ID 作为单个路径段写入并百分号编码，`/` 和点段不会改写请求路径
    fn balance_url(&self, user_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClaimError::Internal(format!("积分服务地址无效: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "users", "customer", user_id, "points"]);
        Ok(url)
    }

    async fn fetch(&self, user_id: &str) -> Result<PointBalanceView> {
        let url = self.balance_url(user_id)?;

        let mut trace_headers = HashMap::new();
        inject_to_headers(&mut trace_headers);

        let mut request = self.http.get(url);
        for (name, value) in &trace_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key.as_str());
        }

        let response = request.send().await.map_err(upstream_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClaimError::Upstream {
                service: POINT_SERVICE.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        let body: ApiResponse<PointBalanceView> =
            response.json().await.map_err(upstream_error)?;
        body.data.ok_or_else(|| ClaimError::Upstream {
            service: POINT_SERVICE.to_string(),
            message: format!("响应缺少余额数据: {}", body.code),
        })
    }
}

fn upstream_error(err: reqwest::Error) -> ClaimError {
    let message = if err.is_timeout() {
        "请求超时".to_string()
    } else {
        err.to_string()
    };
    ClaimError::Upstream {
        service: POINT_SERVICE.to_string(),
        message,
    }
}

#[async_trait]
impl PointBalanceClient for HttpPointClient {
    #[instrument(skip(self))]
    async fn get_balance(&self, user_id: &str) -> Result<PointBalanceView> {
        // 点段在拼接路径时会被丢弃
        if user_id.is_empty() || user_id == "." || user_id == ".." {
            return Err(ClaimError::Validation(format!("非法用户 ID: {user_id:?}")));
        }

        let result = self.breaker.call(|| self.fetch(user_id)).await;

        match result {
            Ok(balance) => {
                debug!(total_points = balance.total_points, "积分余额查询成功");
                Ok(balance)
            }
            Err(CircuitBreakerError::Open { .. }) => Err(ClaimError::UpstreamUnavailable {
                service: POINT_SERVICE.to_string(),
            }),
            Err(CircuitBreakerError::ServiceError(e)) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

/// 固定余额表，未登记的用户余额为 0
#[derive(Default)]
pub struct StaticPointClient {
    balances: Mutex<HashMap<String, i64>>,
    unavailable: Mutex<bool>,
}

impl StaticPointClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: &str, total_points: i64) {
        self.balances
            .lock()
            .insert(user_id.to_string(), total_points);
    }

    /// 模拟积分服务不可达
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl PointBalanceClient for StaticPointClient {
    async fn get_balance(&self, user_id: &str) -> Result<PointBalanceView> {
        if *self.unavailable.lock() {
            return Err(ClaimError::Upstream {
                service: POINT_SERVICE.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let total_points = self.balances.lock().get(user_id).copied().unwrap_or(0);
        Ok(PointBalanceView {
            user_id: user_id.to_string(),
            total_points,
            level: loyalty_shared::tier::Tier::for_points(total_points),
        })
    }
}
