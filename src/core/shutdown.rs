//! 优雅关闭处理
//!
//! 统一监听 Ctrl+C / SIGTERM，按注册顺序执行清理：
//! 先停止仍在运行的工作流实例（拒绝挂起的审批），再关闭 Worker 客户端。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rpc::RpcClient;
use crate::workflow::WorkflowExecutor;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 主流程结束
    Completed,
    FatalError(String),
}

/// 关闭信号：记录首个触发原因并取消 token
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭；已触发时保留最初的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM；关闭由其他途径触发时任务随之退出
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = manager.token.cancelled() => return,
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => ShutdownReason::UserInitiated,
                    Err(e) => {
                        tracing::warn!(error = %e, "Ctrl+C handler unavailable");
                        manager.token.cancelled().await;
                        return;
                    }
                },
                _ = terminate_signal() => ShutdownReason::Signal,
            };
            tracing::info!(reason = ?reason, "Signal received, initiating graceful shutdown");
            manager.shutdown(reason);
        })
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理，每项有独立超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务，返回成功完成的数量
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(tasks = self.cleanup_tasks.len(), "Running cleanup tasks");

        let mut succeeded = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    succeeded += 1;
                    tracing::info!(task = name, "Cleanup task completed");
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "Cleanup task failed");
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout_ms = self.timeout.as_millis() as u64, "Cleanup task timed out");
                }
            }
        }
        succeeded
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 停止所有未结束的工作流实例
pub struct WorkflowStopCleanup {
    executor: WorkflowExecutor,
}

impl WorkflowStopCleanup {
    pub fn new(executor: WorkflowExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WorkflowStopCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        for state in self.executor.list_instances().await {
            if !state.status.is_terminal() && self.executor.stop_workflow(&state.instance_id).await {
                tracing::info!(instance_id = %state.instance_id, "Stopped running instance for shutdown");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Workflows"
    }
}

/// 关闭 Worker 客户端：拒绝待决调用并终止 Worker 进程
pub struct RpcClientCleanup {
    client: RpcClient,
}

impl RpcClientCleanup {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for RpcClientCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.client.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WorkerClient"
    }
}

/// 运行主流程直到结束或收到关闭信号，然后执行清理。
/// 主流程正常结束时返回其输出，被信号打断时返回 None。
pub async fn run_with_graceful_shutdown<F, T>(
    coordinator: &ShutdownCoordinator,
    app: F,
) -> Option<T>
where
    F: Future<Output = T>,
{
    let manager = coordinator.manager();
    let listener = manager.listen_for_signals();

    let output = tokio::select! {
        output = app => {
            tracing::info!("Application finished normally");
            manager.shutdown(ShutdownReason::Completed);
            Some(output)
        }
        _ = manager.cancelled() => {
            tracing::info!(reason = ?manager.reason(), "Shutting down before the application finished");
            None
        }
    };

    coordinator.run_cleanup().await;
    let _ = listener.await;
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::WorkerConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);
        manager.shutdown(ShutdownReason::FatalError("worker lost".into()));
        manager.shutdown(ShutdownReason::Completed);
        assert!(manager.is_shutdown());
        assert_eq!(manager.reason(), Some(ShutdownReason::FatalError("worker lost".into())));
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("flush failed");
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_every_task() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        coordinator.register(MockCleanup { called: first.clone(), fail: true });
        coordinator.register(MockCleanup { called: second.clone(), fail: false });

        assert_eq!(coordinator.run_cleanup().await, 1);
        assert!(first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rpc_client_cleanup_shuts_client_down() {
        let client = RpcClient::new(WorkerConfig::new("phaseflow-worker"));
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(RpcClientCleanup::new(client.clone()));

        let out = run_with_graceful_shutdown(&coordinator, async { 7 }).await;
        assert_eq!(out, Some(7));
        assert!(client.is_shutting_down());
        assert!(coordinator.manager().is_shutdown());
        assert_eq!(coordinator.manager().reason(), Some(ShutdownReason::Completed));
    }

    #[tokio::test]
    async fn test_external_shutdown_interrupts_app_and_runs_cleanup() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(manager.clone());
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(MockCleanup { called: called.clone(), fail: false });

        let trigger = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.shutdown(ShutdownReason::Signal);
        });
        let out = run_with_graceful_shutdown(&coordinator, std::future::pending::<()>()).await;
        assert_eq!(out, None);
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }
}
