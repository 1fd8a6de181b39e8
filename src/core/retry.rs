//! 重试引擎
//!
//! 每次尝试施加超时；失败时先分类，只有「还有剩余次数 + 分类策略允许 + 调用方谓词同意」才继续，
//! 否则立即返回分类后的错误。下一次的等待 = min(max_delay, initial × multiplier^(n-1))，再加 ±jitter。

use std::fmt;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout, Instant};

use crate::core::classifier::ErrorClassifier;
use crate::core::error::{ClassifiedError, ErrorContext};

/// 调用方重试谓词：(分类后的错误, 已失败的尝试序号) -> 是否继续
pub type ShouldRetryFn = Arc<dyn Fn(&ClassifiedError, u32) -> bool + Send + Sync>;
/// 重试回调：(分类后的错误, 已失败的尝试序号, 即将等待的时长)
pub type OnRetryFn = Arc<dyn Fn(&ClassifiedError, u32, Duration) + Send + Sync>;

/// 重试参数
#[derive(Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 抖动比例（0.1 表示 ±10%）
    pub jitter_factor: f64,
    pub per_attempt_timeout: Duration,
    /// 分类时使用的上下文
    pub context: ErrorContext,
    pub should_retry: Option<ShouldRetryFn>,
    pub on_retry: Option<OnRetryFn>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            per_attempt_timeout: Duration::from_millis(300_000),
            context: ErrorContext::General,
            should_retry: None,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .field("per_attempt_timeout", &self.per_attempt_timeout)
            .field("context", &self.context)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn with_per_attempt_timeout(mut self, t: Duration) -> Self {
        self.per_attempt_timeout = t;
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_should_retry(
        mut self,
        f: impl Fn(&ClassifiedError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub fn with_on_retry(
        mut self,
        f: impl Fn(&ClassifiedError, u32, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// 第 `attempt` 次失败后的基础等待（不含抖动）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        let ms = if base_ms.is_finite() { base_ms.min(max_ms) } else { max_ms };
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

/// 在基础等待上施加 ±factor 的随机扰动，下限为 0
fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let base = delay.as_secs_f64();
    let spread = base * factor;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base + offset).max(0.0))
}

/// 执行结果：成功值或最终的分类错误，以及尝试次数与总耗时
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ClassifiedError>,
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, ClassifiedError> {
        self.result
    }
}

/// 带指数退避与抖动的重试执行器
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    classifier: ErrorClassifier,
}

impl RetryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classifier(classifier: ErrorClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// 执行 `operation`（参数为当前尝试序号，从 1 开始）直到成功或不再允许重试
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F, options: &RetryOptions) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let max_attempts = options.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match timeout(options.per_attempt_timeout, operation(attempt)).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                    };
                }
                Ok(Err(e)) => self.classifier.classify(&e, options.context),
                Err(_) => self.classifier.classify(
                    &format!(
                        "Operation timed out after {}ms",
                        options.per_attempt_timeout.as_millis()
                    ),
                    options.context,
                ),
            };

            let permitted = attempt < max_attempts
                && error.is_retriable()
                && options
                    .should_retry
                    .as_ref()
                    .map_or(true, |f| f(&error, attempt));

            if !permitted {
                tracing::error!(
                    attempt,
                    max_attempts,
                    code = %error.code,
                    category = %error.category,
                    error = %error.technical_message,
                    "Operation failed, giving up"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    total_duration: started.elapsed(),
                };
            }

            let delay = apply_jitter(options.delay_for_attempt(attempt), options.jitter_factor);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                code = %error.code,
                error = %error.technical_message,
                "Operation failed, retrying"
            );
            if let Some(on_retry) = &options.on_retry {
                on_retry(&error, attempt, delay);
            }
            sleep(delay).await;
        }
    }
}
