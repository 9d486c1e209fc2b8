//! 服务间调用的 API Key 校验
//!
//! 内部接口（如积分余额查询）只接受携带 `x-api-key` 的请求。
//! 配置中的 key 以 SHA-256 摘要保存，比较时不提前返回。

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::InternalAuthConfig;
use crate::http::ApiResponse;

pub const API_KEY_HEADER: &str = "x-api-key";

/// 允许调用内部接口的 key 集合
#[derive(Clone, Default)]
pub struct InternalApiKeys {
    digests: Arc<Vec<[u8; 32]>>,
}

impl InternalApiKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests = keys
            .into_iter()
            .filter(|k| !k.as_ref().is_empty())
            .map(|k| digest(k.as_ref()))
            .collect();
        Self {
            digests: Arc::new(digests),
        }
    }

    pub fn from_config(config: &InternalAuthConfig) -> Self {
        Self::new(&config.api_keys)
    }

    /// 未配置任何 key 时不做校验，仅用于本地开发
    pub fn is_open(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn verify(&self, presented: &str) -> bool {
        if self.is_open() {
            return true;
        }
        let presented = digest(presented);
        self.digests
            .iter()
            .fold(false, |found, key| found | constant_time_eq(key, &presented))
    }
}

fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 内部接口鉴权中间件
///
/// ```ignore
/// let internal = Router::new()
///     .route("/users/customer/{id}/points", get(get_balance))
///     .layer(middleware::from_fn_with_state(keys, require_internal_api_key));
/// ```
pub async fn require_internal_api_key(
    State(keys): State<InternalApiKeys>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(key) if keys.verify(key) => next.run(request).await,
        _ if keys.is_open() => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "内部接口 API Key 校验失败");
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error("UNAUTHORIZED", "缺少或无效的 API Key")),
            )
                .into_response()
        }
    }
}
