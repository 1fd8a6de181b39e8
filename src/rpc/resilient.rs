//! 带重试与熔断的工具调用
//!
//! 调用链：RetryEngine → CircuitBreaker → 内层 ToolCaller。
//! 熔断打开时的拒绝被分类为不可重试，重试引擎会立即放弃。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::core::error::ErrorContext;
use crate::core::retry::{RetryEngine, RetryOptions};
use crate::rpc::{RpcError, ToolCaller};

pub struct ResilientCaller {
    inner: Arc<dyn ToolCaller>,
    retry: RetryEngine,
    breaker: CircuitBreaker,
    options: RetryOptions,
}

impl ResilientCaller {
    pub fn new(
        inner: Arc<dyn ToolCaller>,
        options: RetryOptions,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            inner,
            retry: RetryEngine::new(),
            breaker: CircuitBreaker::new("worker-rpc", breaker_config),
            options: options.with_context(ErrorContext::RemoteProcedure),
        }
    }

    pub fn with_retry_engine(mut self, retry: RetryEngine) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }
}

#[async_trait]
impl ToolCaller for ResilientCaller {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        let outcome = self
            .retry
            .execute(
                |attempt| {
                    let arguments = arguments.clone();
                    async move {
                        tracing::debug!(tool = name, attempt, "Calling tool");
                        self.breaker
                            .execute(|| self.inner.call_tool(name, arguments))
                            .await
                            .map_err(|e| match e {
                                CircuitBreakerError::Open { retry_after } => RpcError::CircuitOpen {
                                    retry_after_ms: retry_after.as_millis() as u64,
                                },
                                CircuitBreakerError::Inner(e) => e,
                            })
                    }
                },
                &self.options,
            )
            .await;

        let attempts = outcome.attempts;
        outcome.into_result().map_err(|classified| {
            tracing::debug!(tool = name, attempts, code = %classified.code, "Tool call failed after retries");
            RpcError::Classified(classified)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitState;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// 前 `failures` 次调用返回给定错误，之后成功
    struct Flaky {
        failures: u32,
        error: RpcError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ToolCaller for Flaky {
        async fn call_tool(&self, _name: &str, arguments: Value) -> Result<Value, RpcError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(self.error.clone())
            } else {
                Ok(arguments)
            }
        }
    }

    fn flaky(failures: u32, error: RpcError) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            error,
            calls: AtomicU32::new(0),
        })
    }

    fn options(max_attempts: u32) -> RetryOptions {
        RetryOptions::default()
            .with_max_attempts(max_attempts)
            .with_jitter(0.0)
            .with_initial_delay(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_worker_exit() {
        let inner = flaky(
            2,
            RpcError::ProcessExited {
                tool: "echo".into(),
                reason: "signal: 9 (SIGKILL)".into(),
            },
        );
        let caller = ResilientCaller::new(inner.clone(), options(3), CircuitBreakerConfig::default());
        let out = caller.call_tool("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_error_fails_once() {
        let inner = flaky(
            5,
            RpcError::Remote {
                tool: "lint".into(),
                message: "invalid arguments: missing path".into(),
            },
        );
        let caller = ResilientCaller::new(inner.clone(), options(5), CircuitBreakerConfig::default());
        let err = caller.call_tool("lint", json!({})).await.unwrap_err();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        match err {
            RpcError::Classified(c) => assert_eq!(c.code, "RPC_INVALID_ARGUMENTS"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retrying() {
        let inner = flaky(
            100,
            RpcError::Remote {
                tool: "fetch".into(),
                message: "connection refused".into(),
            },
        );
        let breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
            monitoring_window: Duration::from_secs(120),
        };
        let caller = ResilientCaller::new(inner.clone(), options(5), breaker);
        let err = caller.call_tool("fetch", json!({})).await.unwrap_err();

        // 两次真实失败后熔断打开，第三次尝试被快速拒绝且不再重试
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(caller.breaker().state(), CircuitState::Open);
        match err {
            RpcError::Classified(c) => {
                assert_eq!(c.code, "CIRCUIT_OPEN");
                assert!(!c.is_retriable());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
