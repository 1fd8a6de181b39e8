//! 错误分类类型与恢复动作
//!
//! 与 ErrorClassifier 配合：原始错误文本 → ClassifiedError（类别、严重级别、重试策略、建议动作）。
//! RetryEngine 根据 RetryPolicy 决定是否重试，Orchestrator 将建议动作展示给用户。

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// 错误类别（封闭集合，新增下游系统只需在分类表里加规则）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    Permission,
    ResourceExhaustion,
    Validation,
    Dependency,
    Timeout,
    Configuration,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Validation => "validation",
            Self::Dependency => "dependency",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 重试策略：决定 RetryEngine 是否继续下一次尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// 不重试（如认证失败、参数非法）
    None,
    /// 立即可重试
    Retry,
    /// 按指数退避重试
    RetryWithBackoff,
    /// 需要人工处理后再试
    UserIntervention,
}

impl RetryPolicy {
    /// 是否允许自动重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retry | Self::RetryWithBackoff)
    }
}

/// 原始错误来自哪个下游系统（分类表按上下文优先匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    /// 进程启动（Worker 等）
    ProcessSpawn,
    /// 依赖安装（npm / pip / cargo 等）
    DependencyInstall,
    /// 容器镜像构建
    ContainerBuild,
    /// 持久化存储
    Storage,
    /// 远程过程调用目标（Worker 工具调用）
    RemoteProcedure,
    /// 未指明
    #[default]
    General,
}

/// 建议的恢复动作（可直接展示给用户）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryOperation,
    WaitAndRetry,
    CheckNetworkConnection,
    VerifyCredentials,
    CheckPermissions,
    FreeDiskSpace,
    FreeMemory,
    InstallDependency,
    CheckDependencyVersions,
    ReviewInput,
    UpdateConfiguration,
    RestartWorker,
    CheckServiceStatus,
    ContactSupport,
}

impl RecoveryAction {
    /// 面向用户的动作描述
    pub fn description(&self) -> &'static str {
        match self {
            Self::RetryOperation => "Retry the operation",
            Self::WaitAndRetry => "Wait a moment and try again",
            Self::CheckNetworkConnection => "Check your network connection",
            Self::VerifyCredentials => "Verify your credentials or API keys",
            Self::CheckPermissions => "Check file and directory permissions",
            Self::FreeDiskSpace => "Free up disk space",
            Self::FreeMemory => "Close other applications to free memory",
            Self::InstallDependency => "Install the missing dependency",
            Self::CheckDependencyVersions => "Check dependency versions for conflicts",
            Self::ReviewInput => "Review the input values",
            Self::UpdateConfiguration => "Review and update the configuration",
            Self::RestartWorker => "Restart the worker process",
            Self::CheckServiceStatus => "Check that the downstream service is running",
            Self::ContactSupport => "Contact support if the problem persists",
        }
    }
}

/// 分类后的错误：错误码、类别、严重级别、重试策略、建议动作、用户可读消息
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct ClassifiedError {
    /// 稳定错误码，如 `NETWORK_CONNECTION_REFUSED`
    pub code: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retry_policy: RetryPolicy,
    pub recovery_actions: BTreeSet<RecoveryAction>,
    /// 用户可读消息
    pub message: String,
    /// 原始错误文本
    pub technical_message: String,
    pub context: ErrorContext,
}

impl ClassifiedError {
    pub fn is_retriable(&self) -> bool {
        self.retry_policy.is_retriable()
    }

    /// 建议动作的描述列表（按动作顺序）
    pub fn suggested_actions(&self) -> Vec<String> {
        self.recovery_actions
            .iter()
            .map(|a| a.description().to_string())
            .collect()
    }
}
