//! 熔断器
//!
//! 保护奖励服务对积分服务的同步调用。连续失败达到阈值后跳闸（Open），
//! 恢复窗口到期后放行少量探测请求（HalfOpen），探测全部成功则恢复（Closed），
//! 任一探测失败则重新跳闸。
//!
//! 只有调用方判定为"上游故障"的错误才计入失败，业务错误（如用户不存在）不会触发熔断。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PointClientConfig;

/// 对外暴露的熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// 连续失败多少次后跳闸
    pub failure_threshold: u32,
    /// 跳闸后多久进入半开
    pub recovery_timeout: Duration,
    /// 半开状态放行的探测请求数
    pub half_open_permits: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_permits: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_permits(mut self, permits: u32) -> Self {
        self.half_open_permits = permits.max(1);
        self
    }

    /// 积分服务客户端使用的熔断配置
    pub fn for_point_client(config: &PointClientConfig) -> Self {
        Self::new("point-service")
            .with_failure_threshold(config.failure_threshold)
            .with_recovery_timeout(Duration::from_secs(config.recovery_timeout_secs))
    }
}

/// 状态及其附带的计数
#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { admitted: u32, succeeded: u32 },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// 熔断器，Clone 后共享同一状态
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    phase: Arc<Mutex<Phase>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            half_open_permits = config.half_open_permits,
            "熔断器已创建"
        );

        Self {
            config: Arc::new(config),
            phase: Arc::new(Mutex::new(Phase::Closed { failures: 0 })),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 当前状态；恢复窗口已到期的 Open 视为 HalfOpen
    pub fn state(&self) -> CircuitState {
        match *self.phase.lock() {
            Phase::Open { since } if since.elapsed() >= self.config.recovery_timeout => {
                CircuitState::HalfOpen
            }
            phase => phase.state(),
        }
    }

    /// 申请一次调用许可
    pub fn allow_request(&self) -> bool {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Closed { .. } => true,
            Phase::Open { since } => {
                if since.elapsed() < self.config.recovery_timeout {
                    return false;
                }
                self.enter(
                    &mut phase,
                    Phase::HalfOpen {
                        admitted: 1,
                        succeeded: 0,
                    },
                );
                true
            }
            Phase::HalfOpen {
                ref mut admitted, ..
            } => {
                if *admitted < self.config.half_open_permits {
                    *admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Closed { ref mut failures } => *failures = 0,
            Phase::HalfOpen {
                ref mut succeeded, ..
            } => {
                *succeeded += 1;
                if *succeeded >= self.config.half_open_permits {
                    self.enter(&mut phase, Phase::Closed { failures: 0 });
                }
            }
            Phase::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    self.enter(&mut phase, Phase::Open { since: Instant::now() });
                } else {
                    *phase = Phase::Closed { failures };
                }
            }
            Phase::HalfOpen { .. } => {
                self.enter(&mut phase, Phase::Open { since: Instant::now() });
            }
            // 跳闸期间的失败延长恢复窗口
            Phase::Open { ref mut since } => *since = Instant::now(),
        }
    }

    /// 受保护的调用，所有错误都计为失败
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(f, |_| true).await
    }

    /// 受保护的调用，`is_failure` 返回 false 的错误视为上游正常
    pub async fn call_with<F, Fut, T, E>(
        &self,
        f: F,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            metrics::counter!(
                "circuit_breaker_rejections_total",
                "name" => self.config.name.clone()
            )
            .increment(1);
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            });
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(CircuitBreakerError::ServiceError(e))
            }
        }
    }

    fn enter(&self, phase: &mut Phase, next: Phase) {
        let from = phase.state();
        let to = next.state();
        *phase = next;

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "name" => self.config.name.clone(),
            "from" => from.to_string(),
            "to" => to.to_string()
        )
        .increment(1);
        metrics::gauge!("circuit_breaker_state", "name" => self.config.name.clone())
            .set(to.gauge_value());

        match to {
            CircuitState::Open => warn!(name = %self.config.name, %from, "熔断器跳闸"),
            CircuitState::HalfOpen => info!(name = %self.config.name, "熔断器进入半开状态"),
            CircuitState::Closed => info!(name = %self.config.name, "熔断器已恢复"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("熔断器 '{name}' 处于跳闸状态，请求被拒绝")]
    Open { name: String },

    #[error("{0}")]
    ServiceError(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("point-service")
                .with_failure_threshold(3)
                .with_recovery_timeout(Duration::from_millis(50))
                .with_half_open_permits(2),
        )
    }

    fn trip(cb: &CircuitBreaker) {
        for _ in 0..3 {
            cb.record_failure();
        }
    }

    #[test]
    fn test_trips_after_consecutive_failures() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_trial_calls_close_the_circuit() {
        let cb = breaker();
        trip(&cb);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.allow_request());
        assert!(cb.allow_request());
        // 探测配额用完
        assert!(!cb.allow_request());

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker();
        trip(&cb);
        std::thread::sleep(Duration::from_millis(80));

        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[tokio::test]
    async fn test_call_rejects_when_open() {
        let cb = breaker();
        for _ in 0..3 {
            let _: Result<(), _> = cb.call(|| async { Err("timeout") }).await;
        }

        let result: Result<i32, CircuitBreakerError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn test_business_errors_do_not_trip() {
        let cb = breaker();
        for _ in 0..5 {
            let result: Result<(), _> = cb
                .call_with(|| async { Err("user not found") }, |e| *e != "user not found")
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::ServiceError(_))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_point_client_config() {
        let config = CircuitBreakerConfig::for_point_client(&PointClientConfig {
            failure_threshold: 7,
            recovery_timeout_secs: 12,
            ..Default::default()
        });
        assert_eq!(config.name, "point-service");
        assert_eq!(config.failure_threshold, 7);
        assert_eq!(config.recovery_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_error_display() {
        let err: CircuitBreakerError<String> = CircuitBreakerError::Open {
            name: "point-service".to_string(),
        };
        assert!(err.to_string().contains("跳闸"));
        let err: CircuitBreakerError<String> =
            CircuitBreakerError::ServiceError("connection refused".to_string());
        assert_eq!(err.to_string(), "connection refused");
    }
}
