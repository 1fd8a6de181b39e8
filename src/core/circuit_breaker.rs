//! 熔断器：CLOSED / OPEN / HALF_OPEN
//!
//! - CLOSED：监控窗口内失败数达到 failure_threshold → OPEN
//! - OPEN：reset_timeout 之前的调用直接拒绝（不执行被包装的操作）；之后的首个调用转入 HALF_OPEN
//! - HALF_OPEN：连续 success_threshold 次成功 → CLOSED；任意一次失败 → OPEN
//!
//! 窗口外的失败记录在每次访问时惰性清理。状态只通过 execute 内部的转换改变。

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断参数
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
            success_threshold: 2,
            monitoring_window: Duration::from_millis(120_000),
        }
    }
}

/// 熔断器错误：打开时的快速失败，或被包装操作自身的错误
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open (retry after {}ms)", .retry_after.as_millis())]
    Open { retry_after: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// 状态快照
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub half_open_successes: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// 窗口内的失败（时间, 错误文本），按时间排序
    failures: VecDeque<(Instant, String)>,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.failures.front() {
            if now.duration_since(*at) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// 熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        inner.prune(Instant::now(), self.config.monitoring_window);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        inner.prune(Instant::now(), self.config.monitoring_window);
        CircuitBreakerStats {
            state: inner.state,
            failures_in_window: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
            opened_at: inner.opened_at,
        }
    }

    /// 唯一入口：打开时快速失败，否则执行操作并记录结果
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if let Err(retry_after) = self.admit() {
            tracing::debug!(breaker = %self.name, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, rejecting call");
            return Err(CircuitBreakerError::Open { retry_after });
        }
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure(e.to_string());
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// OPEN 且未到 reset_timeout 时返回剩余等待时长
    fn admit(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(now, self.config.monitoring_window);
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let opened_at = inner.opened_at.unwrap_or(now);
        let elapsed = now.duration_since(opened_at);
        if elapsed >= self.config.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            tracing::info!(breaker = %self.name, "Circuit half-open, probing");
            Ok(())
        } else {
            Err(self.config.reset_timeout - elapsed)
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.prune(Instant::now(), self.config.monitoring_window);
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.half_open_successes = 0;
                inner.opened_at = None;
                tracing::info!(breaker = %self.name, "Circuit closed");
            }
        }
    }

    fn on_failure(&self, error: String) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(now, self.config.monitoring_window);
        inner.failures.push_back((now, error));
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures.len() >= self.config.failure_threshold as usize,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.half_open_successes = 0;
            tracing::warn!(
                breaker = %self.name,
                failures = inner.failures.len(),
                last_error = %inner.failures.back().map(|(_, e)| e.as_str()).unwrap_or(""),
                "Circuit opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(1),
                success_threshold: 2,
                monitoring_window: Duration::from_secs(10),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker();
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Inner("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let res = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;
        assert!(res.unwrap_err().is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_close() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1500)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_pruned() {
        let cb = breaker();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.stats().failures_in_window, 0);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_error_message() {
        let err: CircuitBreakerError<String> = CircuitBreakerError::Open {
            retry_after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Circuit breaker is open (retry after 250ms)");
    }
}
