//! 工作流执行器
//!
//! 每个实例一个任务，按数组顺序逐个执行阶段，同一实例任意时刻最多一个阶段在执行。
//! 审批阶段以单个 ApprovalTicket 挂起，直到 approve / reject / stop。
//! 任意阶段失败即终止实例（已完成的阶段保留记录）；无论以何种方式退出，版本锁都会释放。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, RwLock};
use tokio::time::sleep;

use crate::core::retry::RetryOptions;
use crate::rpc::store::{DefinitionStore, PhaseExecutionStatus, PhaseExecutionUpdate};
use crate::rpc::ToolCaller;
use crate::workflow::capability::{build_prompt, CapabilityExecutor, CapabilityRequest};
use crate::workflow::events::{EventBus, EventCategory, PhaseEvent, Subscription, SubscriptionId};
use crate::workflow::gate::{AutoPassGate, GateEvaluator};
use crate::workflow::types::*;

/// 子工作流阶段的推进方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubWorkflowMode {
    /// 创建子实例后立即继续
    #[default]
    Detached,
    /// 轮询直到子实例结束，子实例失败则父实例失败
    AwaitChild,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 实例进入终态后在注册表中保留的时长
    pub eviction_delay: Duration,
    pub sub_workflow_mode: SubWorkflowMode,
    pub sub_workflow_poll: Duration,
    /// 版本锁释放失败后的首次重试等待，之后翻倍直至上限
    pub unlock_retry_initial: Duration,
    pub unlock_retry_max: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            eviction_delay: Duration::from_secs(300),
            sub_workflow_mode: SubWorkflowMode::Detached,
            sub_workflow_poll: Duration::from_millis(1000),
            unlock_retry_initial: Duration::from_millis(1000),
            unlock_retry_max: Duration::from_millis(30_000),
        }
    }
}

/// 审批挂起的结果
#[derive(Debug)]
enum ApprovalDecision {
    Approved,
    Rejected(String),
    Stopped,
}

struct ApprovalTicket {
    phase_id: PhaseId,
    tx: oneshot::Sender<ApprovalDecision>,
}

/// 正在等待审批的阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub instance_id: InstanceId,
    pub phase_id: PhaseId,
}

struct InstanceEntry {
    state: WorkflowExecutionState,
    ticket: Option<ApprovalTicket>,
    stop_requested: bool,
}

struct ExecutorInner {
    store: DefinitionStore,
    capabilities: Arc<dyn CapabilityExecutor>,
    gate: Arc<dyn GateEvaluator>,
    events: EventBus,
    instances: RwLock<HashMap<InstanceId, InstanceEntry>>,
    config: ExecutorConfig,
}

/// 工作流执行器（克隆共享同一注册表）
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<ExecutorInner>,
}

impl WorkflowExecutor {
    /// 使用默认的 AutoPassGate
    pub fn new(
        caller: Arc<dyn ToolCaller>,
        capabilities: Arc<dyn CapabilityExecutor>,
        config: ExecutorConfig,
    ) -> Self {
        Self::with_gate(caller, capabilities, Arc::new(AutoPassGate), config)
    }

    pub fn with_gate(
        caller: Arc<dyn ToolCaller>,
        capabilities: Arc<dyn CapabilityExecutor>,
        gate: Arc<dyn GateEvaluator>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store: DefinitionStore::new(caller),
                capabilities,
                gate,
                events: EventBus::new(),
                instances: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    /// 启动实例：读取定义、创建持久记录、获取版本锁、登记为 running，然后在后台执行阶段循环。
    /// 准备阶段的失败直接返回；循环中的失败记录到实例状态。
    pub async fn start_workflow(
        &self,
        definition_id: &str,
        version: Option<u32>,
        owner_ids: &[String],
        start_phase: usize,
    ) -> Result<InstanceId, WorkflowError> {
        let inner = &self.inner;
        let definition = inner.store.get_definition(definition_id, version).await?;
        if start_phase > 0 && start_phase >= definition.phases.len() {
            return Err(WorkflowError::StartPhaseOutOfRange {
                index: start_phase,
                count: definition.phases.len(),
            });
        }

        let instance_id = inner
            .store
            .create_instance(&definition.id, definition.version, owner_ids, start_phase)
            .await?;
        let locked = match inner
            .store
            .lock_version(&definition.id, definition.version, &instance_id)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(WorkflowError::VersionLocked {
                definition_id: definition.id.clone(),
                version: definition.version,
            }),
            Err(e) => Err(WorkflowError::from(e)),
        };
        if let Err(e) = locked {
            inner.abandon_instance(&definition, &instance_id, start_phase, &e).await;
            return Err(e);
        }

        let mut state = WorkflowExecutionState::new(instance_id.clone(), &definition, owner_ids.to_vec());
        state.status = ExecutionStatus::Running;
        inner.instances.write().await.insert(
            instance_id.clone(),
            InstanceEntry {
                state,
                ticket: None,
                stop_requested: false,
            },
        );

        tracing::info!(
            instance_id = %instance_id,
            definition_id = %definition.id,
            version = definition.version,
            phases = definition.phases.len(),
            start_phase,
            "Workflow instance started"
        );

        tokio::spawn(run_instance(
            Arc::clone(inner),
            Arc::new(definition),
            instance_id.clone(),
            start_phase,
        ));
        Ok(instance_id)
    }

    /// 批准等待中的阶段；实例或阶段不匹配时返回 false
    pub async fn approve_phase(&self, instance_id: &str, phase_id: &str) -> bool {
        self.resolve_ticket(instance_id, phase_id, ApprovalDecision::Approved).await
    }

    /// 拒绝等待中的阶段（实例随后失败）；不匹配时返回 false
    pub async fn reject_phase(&self, instance_id: &str, phase_id: &str, reason: &str) -> bool {
        self.resolve_ticket(instance_id, phase_id, ApprovalDecision::Rejected(reason.to_string()))
            .await
    }

    async fn resolve_ticket(&self, instance_id: &str, phase_id: &str, decision: ApprovalDecision) -> bool {
        let mut instances = self.inner.instances.write().await;
        let Some(entry) = instances.get_mut(instance_id) else {
            return false;
        };
        if entry.ticket.as_ref().map(|t| t.phase_id.as_str()) != Some(phase_id) {
            tracing::debug!(instance_id, phase_id, "No matching approval ticket");
            return false;
        }
        let Some(ticket) = entry.ticket.take() else {
            return false;
        };
        entry.state.status = ExecutionStatus::Running;
        tracing::info!(instance_id, phase_id, decision = ?decision, "Approval resolved");
        ticket.tx.send(decision).is_ok()
    }

    /// 停止实例：标记为 failed 并拒绝挂起的审批；进行中的 agent 调用会跑完，循环在下一阶段前退出。
    /// 实例不存在或已结束时返回 false。
    pub async fn stop_workflow(&self, instance_id: &str) -> bool {
        let mut instances = self.inner.instances.write().await;
        let Some(entry) = instances.get_mut(instance_id) else {
            return false;
        };
        if entry.state.status.is_terminal() {
            return false;
        }
        entry.stop_requested = true;
        entry.state.status = ExecutionStatus::Failed;
        entry.state.completed_at = Some(Utc::now());
        entry.state.error = Some(InstanceFailure::from_classified(
            &WorkflowError::Stopped.classified(),
            entry.state.current_phase_id.clone(),
        ));
        if let Some(ticket) = entry.ticket.take() {
            let _ = ticket.tx.send(ApprovalDecision::Stopped);
        }
        tracing::info!(instance_id, "Workflow stopped by user");
        true
    }

    pub async fn get_state(&self, instance_id: &str) -> Option<WorkflowExecutionState> {
        self.inner
            .instances
            .read()
            .await
            .get(instance_id)
            .map(|e| e.state.clone())
    }

    pub async fn list_instances(&self) -> Vec<WorkflowExecutionState> {
        let mut states: Vec<_> = self
            .inner
            .instances
            .read()
            .await
            .values()
            .map(|e| e.state.clone())
            .collect();
        states.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        states
    }

    pub async fn pending_approval(&self, instance_id: &str) -> Option<PendingApproval> {
        self.inner
            .instances
            .read()
            .await
            .get(instance_id)
            .and_then(|e| e.ticket.as_ref())
            .map(|t| PendingApproval {
                instance_id: instance_id.to_string(),
                phase_id: t.phase_id.clone(),
            })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self, category: EventCategory) -> Subscription {
        self.inner.events.subscribe(category)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.inner.events.subscribe_all()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

/// 实例任务：执行阶段循环，捕获 panic，释放版本锁，写入终态，安排清理
async fn run_instance(
    inner: Arc<ExecutorInner>,
    definition: Arc<WorkflowDefinition>,
    instance_id: InstanceId,
    start_phase: usize,
) {
    let result = AssertUnwindSafe(inner.run_phases(&definition, &instance_id, start_phase))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(WorkflowError::Panicked(panic_message(panic.as_ref()))));

    inner
        .release_lock(&definition.id, definition.version, &instance_id)
        .await;

    inner.finish(&instance_id, result).await;
    inner.schedule_eviction(instance_id);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ExecutorInner {
    /// 准备阶段失败：持久记录已创建但不会执行，将其标记为失败
    async fn abandon_instance(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
        start_phase: usize,
        error: &WorkflowError,
    ) {
        let Some(phase) = definition.phases.get(start_phase) else {
            return;
        };
        let update = PhaseExecutionUpdate::new(instance_id, &phase.id, PhaseExecutionStatus::Failed)
            .with_error(error.to_string());
        if let Err(e) = self.store.update_phase_execution(&update).await {
            tracing::warn!(instance_id, error = %e, "Failed to mark abandoned instance as failed");
        }
        tracing::warn!(instance_id, error = %error, "Workflow instance abandoned during setup");
    }

    /// 释放版本锁；首次失败后转入后台按退避重试，直到成功或客户端关闭
    async fn release_lock(self: &Arc<Self>, definition_id: &str, version: u32, instance_id: &str) {
        let err = match self.store.unlock_version(definition_id, version, instance_id).await {
            Ok(()) => return,
            Err(e) => e,
        };
        if err.is_shutting_down() {
            tracing::warn!(instance_id, definition_id, version, "Worker shutting down, version lock left held");
            return;
        }
        tracing::warn!(instance_id, error = %err, "Failed to release version lock, retrying in background");

        let schedule = RetryOptions::default()
            .with_initial_delay(self.config.unlock_retry_initial)
            .with_max_delay(self.config.unlock_retry_max);
        let weak = Arc::downgrade(self);
        let definition_id = definition_id.to_string();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            let mut attempt = 1u32;
            loop {
                sleep(schedule.delay_for_attempt(attempt)).await;
                let Some(inner) = weak.upgrade() else { return };
                attempt += 1;
                match inner.store.unlock_version(&definition_id, version, &instance_id).await {
                    Ok(()) => {
                        tracing::info!(instance_id = %instance_id, attempt, "Version lock released");
                        return;
                    }
                    Err(e) if e.is_shutting_down() => {
                        tracing::warn!(instance_id = %instance_id, attempt, "Worker shutting down, version lock left held");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(instance_id = %instance_id, attempt, error = %e, "Version lock release failed");
                    }
                }
            }
        });
    }

    async fn run_phases(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
        start_phase: usize,
    ) -> Result<(), WorkflowError> {
        let mut previous_output: Option<Value> = None;

        for phase in definition.phases.iter().skip(start_phase) {
            if self.stop_requested(instance_id).await {
                return Err(WorkflowError::Stopped);
            }
            self.set_current_phase(instance_id, &phase.id).await;
            self.emit(instance_id, phase, EventCategory::Starting, None, None);
            tracing::info!(instance_id, phase_id = %phase.id, kind = ?phase.kind, "Phase starting");

            match self
                .run_phase(definition, instance_id, phase, previous_output.as_ref())
                .await
            {
                Ok(output) => {
                    self.mark_completed(instance_id, &phase.id).await;
                    self.emit(instance_id, phase, EventCategory::Completed, Some(output.clone()), None);
                    tracing::info!(instance_id, phase_id = %phase.id, "Phase completed");
                    previous_output = Some(output);
                }
                Err(e) => {
                    tracing::warn!(instance_id, phase_id = %phase.id, error = %e, "Phase failed");
                    self.emit(instance_id, phase, EventCategory::Failed, None, Some(e.to_string()));
                    let update = PhaseExecutionUpdate::new(instance_id, &phase.id, PhaseExecutionStatus::Failed)
                        .with_error(e.to_string());
                    if let Err(store_err) = self.store.update_phase_execution(&update).await {
                        tracing::warn!(instance_id, phase_id = %phase.id, error = %store_err, "Failed to record phase failure");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// 持久化 running → 执行 → 持久化结果
    async fn run_phase(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
        phase: &Phase,
        previous_output: Option<&Value>,
    ) -> Result<Value, WorkflowError> {
        self.store
            .update_phase_execution(&PhaseExecutionUpdate::new(
                instance_id,
                &phase.id,
                PhaseExecutionStatus::Running,
            ))
            .await?;
        let output = self
            .execute_phase(definition, instance_id, phase, previous_output)
            .await?;
        self.store
            .record_phase_result(instance_id, &phase.id, &output)
            .await?;
        Ok(output)
    }

    async fn execute_phase(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
        phase: &Phase,
        previous_output: Option<&Value>,
    ) -> Result<Value, WorkflowError> {
        match phase.kind {
            PhaseKind::Agent => self.run_agent(definition, instance_id, phase, previous_output).await,
            PhaseKind::Gate => self.run_gate(instance_id, phase, previous_output).await,
            PhaseKind::UserApproval => self.run_approval(instance_id, phase).await,
            PhaseKind::SubWorkflow => self.run_sub_workflow(instance_id, phase).await,
            PhaseKind::Loop => {
                tracing::warn!(instance_id, phase_id = %phase.id, "Loop phases are not implemented, skipping iteration");
                Ok(json!({ "status": "not_implemented" }))
            }
        }
    }

    async fn run_agent(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
        phase: &Phase,
        previous_output: Option<&Value>,
    ) -> Result<Value, WorkflowError> {
        let capability_ref = phase.capability_ref.clone().ok_or_else(|| {
            WorkflowError::InvalidConfiguration(format!("agent phase '{}' has no capability_ref", phase.id))
        })?;
        let request = CapabilityRequest {
            capability_ref,
            instance_id: instance_id.to_string(),
            phase_id: phase.id.clone(),
            prompt: build_prompt(definition, phase, previous_output),
            context: previous_output.cloned(),
        };
        let result = self.capabilities.execute(request).await?;
        if !result.success {
            return Err(WorkflowError::AgentFailed {
                phase_id: phase.id.clone(),
                message: result
                    .error
                    .unwrap_or_else(|| "capability reported failure".to_string()),
            });
        }
        Ok(json!({
            "success": true,
            "output": result.output,
            "session_id": result.session_id,
        }))
    }

    async fn run_gate(
        &self,
        instance_id: &str,
        phase: &Phase,
        previous_output: Option<&Value>,
    ) -> Result<Value, WorkflowError> {
        let decision = self.gate.evaluate(phase, previous_output).await;
        if !decision.evaluated {
            tracing::warn!(
                instance_id,
                phase_id = %phase.id,
                condition = ?phase.gate_condition,
                "Gate condition not evaluated, passing by default"
            );
        }
        if !decision.passed {
            return Err(WorkflowError::GateFailed {
                phase_id: phase.id.clone(),
                reason: decision.reason.unwrap_or_else(|| "condition not met".to_string()),
            });
        }
        Ok(json!({
            "passed": true,
            "condition": phase.gate_condition,
            "unimplemented": !decision.evaluated,
        }))
    }

    async fn run_approval(&self, instance_id: &str, phase: &Phase) -> Result<Value, WorkflowError> {
        if !phase.requires_approval {
            return Ok(json!({ "approved": true, "required": false }));
        }

        self.store
            .update_phase_execution(&PhaseExecutionUpdate::new(
                instance_id,
                &phase.id,
                PhaseExecutionStatus::WaitingApproval,
            ))
            .await?;

        let rx = {
            let mut instances = self.instances.write().await;
            let entry = instances
                .get_mut(instance_id)
                .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;
            if entry.stop_requested {
                return Err(WorkflowError::Stopped);
            }
            if let Some(existing) = &entry.ticket {
                return Err(WorkflowError::ApprovalAlreadyPending(existing.phase_id.clone()));
            }
            let (tx, rx) = oneshot::channel();
            entry.ticket = Some(ApprovalTicket {
                phase_id: phase.id.clone(),
                tx,
            });
            entry.state.status = ExecutionStatus::Paused;
            rx
        };
        self.emit(instance_id, phase, EventCategory::WaitingApproval, None, None);
        tracing::info!(instance_id, phase_id = %phase.id, "Waiting for approval");

        match rx.await.unwrap_or(ApprovalDecision::Stopped) {
            ApprovalDecision::Approved => Ok(json!({ "approved": true, "required": true })),
            ApprovalDecision::Rejected(reason) => Err(WorkflowError::ApprovalRejected {
                phase_id: phase.id.clone(),
                reason,
            }),
            ApprovalDecision::Stopped => Err(WorkflowError::Stopped),
        }
    }

    async fn run_sub_workflow(&self, instance_id: &str, phase: &Phase) -> Result<Value, WorkflowError> {
        let definition_ref = phase.sub_workflow_ref.as_deref().ok_or_else(|| {
            WorkflowError::InvalidConfiguration(format!("sub-workflow phase '{}' has no sub_workflow_ref", phase.id))
        })?;
        let child = self
            .store
            .start_sub_workflow(instance_id, &phase.id, definition_ref)
            .await?;
        tracing::info!(instance_id, phase_id = %phase.id, child_instance_id = %child, mode = ?self.config.sub_workflow_mode, "Sub-workflow started");

        match self.config.sub_workflow_mode {
            SubWorkflowMode::Detached => Ok(json!({
                "child_instance_id": child,
                "mode": "detached",
            })),
            SubWorkflowMode::AwaitChild => loop {
                sleep(self.config.sub_workflow_poll).await;
                if self.stop_requested(instance_id).await {
                    return Err(WorkflowError::Stopped);
                }
                let snapshot = self.store.get_instance_status(&child).await?;
                match snapshot.status {
                    ExecutionStatus::Completed => {
                        return Ok(json!({
                            "child_instance_id": child,
                            "mode": "await_child",
                            "status": "completed",
                        }))
                    }
                    ExecutionStatus::Failed => {
                        return Err(WorkflowError::SubWorkflowFailed {
                            child_instance_id: child,
                            message: snapshot.error.unwrap_or_else(|| "unknown error".to_string()),
                        })
                    }
                    _ => continue,
                }
            },
        }
    }

    fn emit(
        &self,
        instance_id: &str,
        phase: &Phase,
        status: EventCategory,
        output: Option<Value>,
        error: Option<String>,
    ) {
        self.events.emit(PhaseEvent {
            instance_id: instance_id.to_string(),
            phase_id: phase.id.clone(),
            phase_name: phase.name.clone(),
            status,
            output,
            error,
            timestamp: Utc::now(),
        });
    }

    async fn stop_requested(&self, instance_id: &str) -> bool {
        self.instances
            .read()
            .await
            .get(instance_id)
            .map_or(true, |e| e.stop_requested)
    }

    async fn set_current_phase(&self, instance_id: &str, phase_id: &str) {
        if let Some(entry) = self.instances.write().await.get_mut(instance_id) {
            entry.state.current_phase_id = Some(phase_id.to_string());
        }
    }

    async fn mark_completed(&self, instance_id: &str, phase_id: &str) {
        if let Some(entry) = self.instances.write().await.get_mut(instance_id) {
            entry.state.completed_phases.push(phase_id.to_string());
        }
    }

    /// 写入终态；已被 stop 标记为失败的实例保持原样
    async fn finish(&self, instance_id: &str, result: Result<(), WorkflowError>) {
        let mut instances = self.instances.write().await;
        let Some(entry) = instances.get_mut(instance_id) else {
            return;
        };
        entry.ticket = None;
        if entry.state.status.is_terminal() {
            return;
        }
        entry.state.completed_at = Some(Utc::now());
        match result {
            Ok(()) => {
                entry.state.status = ExecutionStatus::Completed;
                tracing::info!(instance_id, "Workflow instance completed");
            }
            Err(e) => {
                let classified = e.classified();
                let failure = InstanceFailure::from_classified(&classified, entry.state.current_phase_id.clone());
                tracing::error!(
                    instance_id,
                    phase_id = ?failure.phase_id,
                    code = %failure.code,
                    error = %failure.technical_message,
                    suggested_actions = ?failure.suggested_actions,
                    "Workflow instance failed"
                );
                entry.state.status = ExecutionStatus::Failed;
                entry.state.error = Some(failure);
            }
        }
    }

    fn schedule_eviction(self: &Arc<Self>, instance_id: InstanceId) {
        let delay = self.config.eviction_delay;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if inner.instances.write().await.remove(&instance_id).is_some() {
                    tracing::debug!(instance_id = %instance_id, "Evicted finished instance");
                }
            }
        });
    }
}
