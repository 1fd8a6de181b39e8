//! Phaseflow - 工作流编排命令行
//!
//! 入口：初始化日志与配置，拉起 Worker 客户端与执行器，运行一个工作流实例直到结束。
//! 审批阶段在终端询问（y 批准，其它输入拒绝）。
//!
//! 用法：`phaseflow [definition_id] [version]`，配置文件路径可由 PHASEFLOW_CONFIG 指定。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use phaseflow::config::load_config;
use phaseflow::core::{
    run_with_graceful_shutdown, RpcClientCleanup, ShutdownCoordinator, ShutdownManager, WorkflowStopCleanup,
};
use phaseflow::observability;
use phaseflow::rpc::{ResilientCaller, RpcClient, ToolCaller};
use phaseflow::workflow::{EventCategory, ExecutionStatus, RpcCapabilityExecutor, WorkflowExecutor};
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_DEFINITION: &str = "demo-release";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var("PHASEFLOW_CONFIG").ok().map(PathBuf::from);
    let app_config = load_config(config_path).context("Failed to load configuration")?;

    let mut args = std::env::args().skip(1);
    let definition_id = args.next().unwrap_or_else(|| DEFAULT_DEFINITION.to_string());
    let version = args
        .next()
        .map(|v| v.parse::<u32>())
        .transpose()
        .context("Version must be a positive integer")?;

    let mut worker_config = app_config.worker.to_worker_config();
    worker_config.program = resolve_worker_program(&worker_config.program);
    let client = RpcClient::new(worker_config);
    client.start().await.context("Failed to start worker")?;

    let caller: Arc<dyn ToolCaller> = Arc::new(ResilientCaller::new(
        Arc::new(client.clone()),
        app_config.retry.to_retry_options(),
        app_config.circuit_breaker.to_breaker_config(),
    ));
    let executor = WorkflowExecutor::new(
        caller.clone(),
        Arc::new(RpcCapabilityExecutor::new(caller)),
        app_config.orchestrator.to_executor_config(),
    );

    let manager = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(manager);
    coordinator.register(WorkflowStopCleanup::new(executor.clone()));
    coordinator.register(RpcClientCleanup::new(client));

    let outcome = run_with_graceful_shutdown(&coordinator, run(executor, definition_id, version)).await;
    match outcome {
        Some(result) => result,
        None => {
            tracing::info!("Interrupted before the workflow finished");
            Ok(())
        }
    }
}

/// 启动实例，打印阶段事件，在审批阶段询问终端，直到实例结束
async fn run(executor: WorkflowExecutor, definition_id: String, version: Option<u32>) -> anyhow::Result<()> {
    let mut events = executor.subscribe_all();
    let instance_id = executor
        .start_workflow(&definition_id, version, &[], 0)
        .await
        .with_context(|| format!("Failed to start workflow '{definition_id}'"))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.instance_id != instance_id {
                    continue;
                }
                tracing::info!(
                    phase_id = %event.phase_id,
                    phase = %event.phase_name,
                    status = ?event.status,
                    output = ?event.output,
                    error = ?event.error,
                    "Phase event"
                );
                if event.status == EventCategory::WaitingApproval {
                    println!("Approve phase '{}'? [y/N]", event.phase_name);
                    let answer = stdin.next_line().await.context("Failed to read approval")?;
                    let approved = answer.map_or(false, |a| a.trim().eq_ignore_ascii_case("y"));
                    if approved {
                        executor.approve_phase(&instance_id, &event.phase_id).await;
                    } else {
                        executor
                            .reject_phase(&instance_id, &event.phase_id, "rejected at terminal")
                            .await;
                    }
                }
            }
            _ = poll.tick() => {
                let Some(state) = executor.get_state(&instance_id).await else { break };
                if !state.status.is_terminal() {
                    continue;
                }
                match state.status {
                    ExecutionStatus::Completed => {
                        tracing::info!(instance_id = %instance_id, phases = state.completed_phases.len(), "Workflow completed");
                        return Ok(());
                    }
                    _ => {
                        let message = state
                            .error
                            .map(|e| format!("{} ({})", e.message, e.code))
                            .unwrap_or_else(|| "unknown error".to_string());
                        anyhow::bail!("Workflow '{definition_id}' failed: {message}");
                    }
                }
            }
        }
    }
    anyhow::bail!("Workflow instance {instance_id} disappeared before finishing")
}

/// 未带路径的 Worker 名优先使用与本程序同目录的可执行文件
fn resolve_worker_program(program: &str) -> String {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return program.to_string();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(program)))
        .filter(|candidate| candidate.exists())
        .map(|candidate| candidate.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}
