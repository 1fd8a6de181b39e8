//! 错误分类器
//!
//! 按顺序匹配分类表：先匹配带上下文的规则（进程启动 / 依赖安装 / 容器构建 / 存储 / RPC），
//! 再匹配通用规则，首个命中的规则决定分类；都不命中时落入 unknown/high/retry。
//! 纯函数，不做 I/O，永不失败。

use std::collections::BTreeSet;
use std::fmt::Display;

use crate::core::error::{
    ClassifiedError, ErrorCategory, ErrorContext, RecoveryAction, RetryPolicy, Severity,
};

use crate::core::error::ErrorCategory as C;
use crate::core::error::RecoveryAction as A;
use crate::core::error::RetryPolicy as P;
use crate::core::error::Severity as S;

/// 单条分类规则：错误文本（小写）包含任一关键词即命中
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    /// None 表示适用于任何上下文
    pub context: Option<ErrorContext>,
    pub keywords: &'static [&'static str],
    pub code: &'static str,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retry_policy: RetryPolicy,
    pub actions: &'static [RecoveryAction],
    pub message: &'static str,
}

impl ClassificationRule {
    fn matches(&self, haystack: &str, context: ErrorContext) -> bool {
        if let Some(ctx) = self.context {
            if ctx != context {
                return false;
            }
        }
        self.keywords.iter().any(|k| haystack.contains(k))
    }
}

const fn rule(
    context: Option<ErrorContext>,
    keywords: &'static [&'static str],
    code: &'static str,
    category: ErrorCategory,
    severity: Severity,
    retry_policy: RetryPolicy,
    actions: &'static [RecoveryAction],
    message: &'static str,
) -> ClassificationRule {
    ClassificationRule {
        context,
        keywords,
        code,
        category,
        severity,
        retry_policy,
        actions,
        message,
    }
}

const SPAWN: Option<ErrorContext> = Some(ErrorContext::ProcessSpawn);
const INSTALL: Option<ErrorContext> = Some(ErrorContext::DependencyInstall);
const CONTAINER: Option<ErrorContext> = Some(ErrorContext::ContainerBuild);
const STORAGE: Option<ErrorContext> = Some(ErrorContext::Storage);
const RPC: Option<ErrorContext> = Some(ErrorContext::RemoteProcedure);
const ANY: Option<ErrorContext> = None;

/// 默认分类表（顺序敏感）
#[rustfmt::skip]
pub const DEFAULT_RULES: &[ClassificationRule] = &[
    // 进程启动
    rule(SPAWN, &["enoent", "no such file or directory", "command not found", "not found"],
        "SPAWN_EXECUTABLE_NOT_FOUND", C::Configuration, S::High, P::UserIntervention,
        &[A::InstallDependency, A::UpdateConfiguration],
        "The worker executable could not be found"),
    rule(SPAWN, &["eacces", "permission denied"],
        "SPAWN_PERMISSION_DENIED", C::Permission, S::High, P::UserIntervention,
        &[A::CheckPermissions],
        "Permission denied while starting the worker process"),
    rule(SPAWN, &["emfile", "too many open files", "eagain", "resource temporarily unavailable"],
        "SPAWN_RESOURCE_LIMIT", C::ResourceExhaustion, S::High, P::RetryWithBackoff,
        &[A::FreeMemory, A::WaitAndRetry],
        "The system ran out of resources while starting the worker process"),
    // 依赖安装
    rule(INSTALL, &["unauthorized", "401", "authentication required", "invalid token"],
        "INSTALL_AUTH_FAILED", C::Authentication, S::High, P::UserIntervention,
        &[A::VerifyCredentials],
        "The package registry rejected the credentials"),
    rule(INSTALL, &["enotfound", "getaddrinfo", "etimedout", "econnreset", "could not resolve host", "network"],
        "INSTALL_NETWORK_ERROR", C::Network, S::Medium, P::RetryWithBackoff,
        &[A::CheckNetworkConnection, A::RetryOperation],
        "Dependencies could not be downloaded because of a network problem"),
    rule(INSTALL, &["eresolve", "conflicting peer dependency", "version conflict", "unable to resolve dependency"],
        "INSTALL_VERSION_CONFLICT", C::Dependency, S::Medium, P::UserIntervention,
        &[A::CheckDependencyVersions],
        "Dependency versions conflict with each other"),
    rule(INSTALL, &["404", "no matching version", "could not find", "not found"],
        "INSTALL_PACKAGE_NOT_FOUND", C::Dependency, S::Medium, P::None,
        &[A::CheckDependencyVersions, A::ReviewInput],
        "A required package does not exist in the registry"),
    // 容器构建
    rule(CONTAINER, &["cannot connect to the docker daemon", "docker daemon", "daemon running"],
        "CONTAINER_DAEMON_UNAVAILABLE", C::Dependency, S::High, P::UserIntervention,
        &[A::CheckServiceStatus],
        "The container daemon is not reachable"),
    rule(CONTAINER, &["pull access denied", "unauthorized", "authentication required"],
        "CONTAINER_REGISTRY_AUTH", C::Authentication, S::High, P::UserIntervention,
        &[A::VerifyCredentials],
        "The container registry rejected the credentials"),
    rule(CONTAINER, &["toomanyrequests", "rate limit"],
        "CONTAINER_RATE_LIMITED", C::Network, S::Medium, P::RetryWithBackoff,
        &[A::WaitAndRetry],
        "The container registry is rate limiting requests"),
    rule(CONTAINER, &["manifest unknown", "not found"],
        "CONTAINER_IMAGE_NOT_FOUND", C::Validation, S::Medium, P::None,
        &[A::ReviewInput, A::UpdateConfiguration],
        "The requested container image does not exist"),
    rule(CONTAINER, &["returned a non-zero code", "failed to solve", "build failed"],
        "CONTAINER_BUILD_STEP_FAILED", C::Validation, S::High, P::UserIntervention,
        &[A::ReviewInput],
        "A container build step failed"),
    // 存储
    rule(STORAGE, &["password authentication failed", "authentication failed", "access denied for user"],
        "STORAGE_AUTH_FAILED", C::Authentication, S::Critical, P::UserIntervention,
        &[A::VerifyCredentials, A::UpdateConfiguration],
        "The storage backend rejected the credentials"),
    rule(STORAGE, &["econnrefused", "connection refused", "could not connect"],
        "STORAGE_UNAVAILABLE", C::Network, S::High, P::RetryWithBackoff,
        &[A::CheckServiceStatus, A::RetryOperation],
        "The storage backend is not reachable"),
    rule(STORAGE, &["too many connections", "connection pool"],
        "STORAGE_POOL_EXHAUSTED", C::ResourceExhaustion, S::High, P::RetryWithBackoff,
        &[A::WaitAndRetry],
        "The storage backend has no free connections"),
    rule(STORAGE, &["deadlock", "could not serialize", "lock timeout", "database is locked"],
        "STORAGE_CONFLICT", C::ResourceExhaustion, S::Medium, P::Retry,
        &[A::RetryOperation],
        "A concurrent storage operation conflicted with this one"),
    rule(STORAGE, &["duplicate key", "unique constraint", "violates"],
        "STORAGE_CONSTRAINT_VIOLATION", C::Validation, S::Medium, P::None,
        &[A::ReviewInput],
        "The data violates a storage constraint"),
    rule(STORAGE, &["no such table", "does not exist"],
        "STORAGE_SCHEMA_MISSING", C::Configuration, S::High, P::UserIntervention,
        &[A::UpdateConfiguration],
        "The storage schema is missing or out of date"),
    // RPC 目标
    rule(RPC, &["no such file or directory", "enoent"],
        "RPC_WORKER_NOT_FOUND", C::Configuration, S::High, P::UserIntervention,
        &[A::InstallDependency, A::UpdateConfiguration],
        "The worker executable could not be found"),
    rule(RPC, &["failed to spawn", "startup timed out"],
        "RPC_WORKER_UNAVAILABLE", C::Dependency, S::High, P::RetryWithBackoff,
        &[A::RestartWorker, A::CheckServiceStatus],
        "The worker process could not be started"),
    rule(RPC, &["shutting down"],
        "RPC_SHUTTING_DOWN", C::Dependency, S::Low, P::None,
        &[],
        "The worker is shutting down"),
    rule(RPC, &["process exited", "crashed", "broken pipe", "worker exited"],
        "RPC_WORKER_EXITED", C::Dependency, S::High, P::RetryWithBackoff,
        &[A::RestartWorker, A::RetryOperation],
        "The worker process exited unexpectedly"),
    rule(RPC, &["unknown tool", "method not found", "tool not found"],
        "RPC_UNKNOWN_TOOL", C::Configuration, S::High, P::None,
        &[A::UpdateConfiguration],
        "The worker does not provide the requested tool"),
    rule(RPC, &["invalid arguments", "invalid params", "missing required"],
        "RPC_INVALID_ARGUMENTS", C::Validation, S::Medium, P::None,
        &[A::ReviewInput],
        "The worker rejected the call arguments"),
    // 通用
    rule(ANY, &["circuit breaker is open", "circuit open"],
        "CIRCUIT_OPEN", C::Dependency, S::High, P::None,
        &[A::WaitAndRetry, A::CheckServiceStatus],
        "The downstream service is temporarily unavailable"),
    rule(ANY, &["timed out", "timeout", "deadline exceeded", "etimedout"],
        "TIMEOUT", C::Timeout, S::Medium, P::RetryWithBackoff,
        &[A::WaitAndRetry, A::RetryOperation],
        "The operation timed out"),
    rule(ANY, &["unauthorized", "401", "invalid api key", "authentication failed", "invalid credentials", "token expired"],
        "AUTH_FAILED", C::Authentication, S::High, P::UserIntervention,
        &[A::VerifyCredentials],
        "Authentication failed"),
    rule(ANY, &["permission denied", "eacces", "eperm", "forbidden", "403", "access denied"],
        "PERMISSION_DENIED", C::Permission, S::High, P::UserIntervention,
        &[A::CheckPermissions],
        "Permission denied"),
    rule(ANY, &["enospc", "no space left", "disk full"],
        "DISK_FULL", C::ResourceExhaustion, S::Critical, P::UserIntervention,
        &[A::FreeDiskSpace],
        "The disk is full"),
    rule(ANY, &["out of memory", "enomem", "cannot allocate memory"],
        "OUT_OF_MEMORY", C::ResourceExhaustion, S::Critical, P::UserIntervention,
        &[A::FreeMemory, A::RestartWorker],
        "The system ran out of memory"),
    rule(ANY, &["rate limit", "too many requests", "429", "quota exceeded"],
        "RATE_LIMITED", C::ResourceExhaustion, S::Medium, P::RetryWithBackoff,
        &[A::WaitAndRetry],
        "Too many requests, the service is rate limiting"),
    rule(ANY, &["econnrefused", "connection refused", "econnreset", "connection reset", "enotfound",
        "getaddrinfo", "socket hang up", "host unreachable", "network"],
        "NETWORK_ERROR", C::Network, S::Medium, P::RetryWithBackoff,
        &[A::CheckNetworkConnection, A::RetryOperation],
        "A network error occurred"),
    rule(ANY, &["cannot find module", "module not found", "no module named", "command not found",
        "not installed", "missing dependency"],
        "DEPENDENCY_MISSING", C::Dependency, S::High, P::UserIntervention,
        &[A::InstallDependency],
        "A required dependency is missing"),
    rule(ANY, &["invalid configuration", "configuration error", "missing environment variable", "not configured"],
        "CONFIGURATION_ERROR", C::Configuration, S::High, P::UserIntervention,
        &[A::UpdateConfiguration],
        "The configuration is invalid"),
    rule(ANY, &["validation failed", "invalid", "malformed", "parse error", "unexpected token"],
        "VALIDATION_ERROR", C::Validation, S::Medium, P::None,
        &[A::ReviewInput],
        "The input is invalid"),
];

/// 未命中任何规则时的兜底分类
const FALLBACK: ClassificationRule = rule(
    ANY,
    &[],
    "UNKNOWN_ERROR",
    C::Unknown,
    S::High,
    P::Retry,
    &[A::RetryOperation, A::ContactSupport],
    "An unexpected error occurred",
);

/// 关键词驱动的错误分类器
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
        }
    }

    /// 在默认表之前插入额外规则（优先匹配）
    pub fn with_rules(mut self, extra: &[ClassificationRule]) -> Self {
        let mut rules = extra.to_vec();
        rules.append(&mut self.rules);
        self.rules = rules;
        self
    }

    /// 分类任意可显示的错误；永不失败
    pub fn classify<E: Display + ?Sized>(&self, err: &E, context: ErrorContext) -> ClassifiedError {
        let technical = err.to_string();
        let haystack = technical.to_lowercase();
        let matched = self
            .rules
            .iter()
            .find(|r| r.matches(&haystack, context))
            .unwrap_or(&FALLBACK);
        build(matched, technical, context)
    }
}

fn build(rule: &ClassificationRule, technical: String, context: ErrorContext) -> ClassifiedError {
    ClassifiedError {
        code: rule.code.to_string(),
        category: rule.category,
        severity: rule.severity,
        retry_policy: rule.retry_policy,
        recovery_actions: rule.actions.iter().copied().collect::<BTreeSet<_>>(),
        message: rule.message.to_string(),
        technical_message: technical,
        context,
    }
}
