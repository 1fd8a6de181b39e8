//! 核心层：错误分类、重试、熔断与优雅关闭

pub mod circuit_breaker;
pub mod classifier;
pub mod error;
pub mod retry;
pub mod shutdown;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use classifier::{ClassificationRule, ErrorClassifier};
pub use error::{ClassifiedError, ErrorCategory, ErrorContext, RecoveryAction, RetryPolicy, Severity};
pub use retry::{RetryEngine, RetryOptions, RetryOutcome};
pub use shutdown::{
    run_with_graceful_shutdown, RpcClientCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, WorkflowStopCleanup,
};
