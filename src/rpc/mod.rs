//! 常驻 Worker 进程 RPC 层
//!
//! - **protocol**: 按行分隔的 JSON 信封与输出切行
//! - **client**: 单进程多路复用客户端（超时、崩溃拒绝、退避重启、优雅关闭）
//! - **resilient**: 重试 + 熔断包装
//! - **store**: 定义存储的便捷工具调用

pub mod client;
pub mod error;
pub mod protocol;
pub mod resilient;
pub mod store;

use async_trait::async_trait;
use serde_json::Value;

pub use client::{RpcClient, WorkerConfig};
pub use error::RpcError;
pub use resilient::ResilientCaller;
pub use store::DefinitionStore;

/// 工具调用接口（RpcClient、ResilientCaller 与测试替身共同实现）
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError>;
}
