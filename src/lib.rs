//! Phaseflow - 多阶段工作流编排与常驻 Worker 进程 RPC
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、重试、熔断、优雅关闭
//! - **observability**: tracing 订阅器初始化
//! - **rpc**: Worker 进程客户端（行分隔 JSON、自动重启）、弹性调用、定义存储
//! - **workflow**: 工作流定义、执行器、审批暂停、事件订阅

pub mod config;
pub mod core;
pub mod observability;
pub mod rpc;
pub mod workflow;
