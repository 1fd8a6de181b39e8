//! RPC 调用错误

use thiserror::Error;

use crate::core::classifier::ErrorClassifier;
use crate::core::error::{ClassifiedError, ErrorContext};

/// Worker 工具调用失败的原因
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("Failed to spawn worker '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Worker startup timed out after {0}ms")]
    StartupTimeout(u64),

    #[error("Worker I/O error: {0}")]
    Io(String),

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Worker process exited while '{tool}' was pending: {reason}")]
    ProcessExited { tool: String, reason: String },

    #[error("Worker is shutting down")]
    ShuttingDown,

    #[error("Tool '{tool}' failed: {message}")]
    Remote { tool: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Circuit breaker is open (retry after {retry_after_ms}ms)")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("{}", .0.technical_message)]
    Classified(ClassifiedError),
}

impl RpcError {
    /// 按 RPC 上下文分类；已分类的错误原样返回
    pub fn classified(&self) -> ClassifiedError {
        match self {
            Self::Classified(c) => c.clone(),
            other => ErrorClassifier::new().classify(other, ErrorContext::RemoteProcedure),
        }
    }

    /// 客户端已进入关闭流程（包括经重试包装后的同类错误）
    pub fn is_shutting_down(&self) -> bool {
        match self {
            Self::ShuttingDown => true,
            Self::Classified(c) => c.code == "RPC_SHUTTING_DOWN",
            _ => false,
        }
    }

    /// 是否由 Worker 进程退出导致
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Self::ProcessExited { .. })
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
