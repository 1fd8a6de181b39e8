//! 工作流类型定义
//!
//! 定义模板（只读）、阶段、实例执行状态与错误类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::classifier::{ClassificationRule, ErrorClassifier};
use crate::core::error::{
    ClassifiedError, ErrorCategory, ErrorContext, RecoveryAction, RetryPolicy, Severity,
};
use crate::rpc::RpcError;

pub type InstanceId = String;
pub type PhaseId = String;

/// 阶段类型（决定由哪个处理器执行）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseKind {
    #[serde(rename = "agent")]
    Agent,
    #[serde(rename = "gate")]
    Gate,
    #[serde(rename = "user-approval")]
    UserApproval,
    #[serde(rename = "subworkflow")]
    SubWorkflow,
    #[serde(rename = "loop")]
    Loop,
}

/// 工作流中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    pub name: String,
    pub kind: PhaseKind,
    /// agent 阶段调用的能力
    #[serde(default)]
    pub capability_ref: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub gate_condition: Option<String>,
    #[serde(default)]
    pub sub_workflow_ref: Option<String>,
}

impl Phase {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: PhaseKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            capability_ref: None,
            description: String::new(),
            requires_approval: false,
            gate_condition: None,
            sub_workflow_ref: None,
        }
    }

    pub fn agent(id: impl Into<String>, name: impl Into<String>, capability: impl Into<String>) -> Self {
        let mut phase = Self::new(id, name, PhaseKind::Agent);
        phase.capability_ref = Some(capability.into());
        phase
    }

    pub fn approval(id: impl Into<String>, name: impl Into<String>) -> Self {
        let mut phase = Self::new(id, name, PhaseKind::UserApproval);
        phase.requires_approval = true;
        phase
    }

    pub fn gate(id: impl Into<String>, name: impl Into<String>, condition: impl Into<String>) -> Self {
        let mut phase = Self::new(id, name, PhaseKind::Gate);
        phase.gate_condition = Some(condition.into());
        phase
    }

    pub fn sub_workflow(id: impl Into<String>, name: impl Into<String>, definition_ref: impl Into<String>) -> Self {
        let mut phase = Self::new(id, name, PhaseKind::SubWorkflow);
        phase.sub_workflow_ref = Some(definition_ref.into());
        phase
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 工作流模板（由外部存储持有，执行期只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub phases: Vec<Phase>,
    /// 声明依赖的能力
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl WorkflowDefinition {
    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }
}

/// 实例状态：pending → running → {paused ↔ running} → {completed | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 失败实例上附带的可展示错误
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceFailure {
    pub code: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub technical_message: String,
    pub suggested_actions: Vec<String>,
    pub phase_id: Option<PhaseId>,
}

impl InstanceFailure {
    pub fn from_classified(classified: &ClassifiedError, phase_id: Option<PhaseId>) -> Self {
        Self {
            code: classified.code.clone(),
            category: classified.category,
            severity: classified.severity,
            message: classified.message.clone(),
            technical_message: classified.technical_message.clone(),
            suggested_actions: classified.suggested_actions(),
            phase_id,
        }
    }
}

/// 单个实例的执行状态（只由执行器写）
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecutionState {
    pub instance_id: InstanceId,
    pub definition_id: String,
    pub definition_version: u32,
    pub owner_ids: Vec<String>,
    pub current_phase_id: Option<PhaseId>,
    pub status: ExecutionStatus,
    /// 已完成的阶段（按完成顺序）
    pub completed_phases: Vec<PhaseId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<InstanceFailure>,
}

impl WorkflowExecutionState {
    pub fn new(instance_id: InstanceId, definition: &WorkflowDefinition, owner_ids: Vec<String>) -> Self {
        Self {
            instance_id,
            definition_id: definition.id.clone(),
            definition_version: definition.version,
            owner_ids,
            current_phase_id: None,
            status: ExecutionStatus::Pending,
            completed_phases: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// 工作流错误类型
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Invalid workflow configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Start phase {index} is out of range for {count} phases")]
    StartPhaseOutOfRange { index: usize, count: usize },

    #[error("Version {version} of workflow '{definition_id}' is locked by another instance")]
    VersionLocked { definition_id: String, version: u32 },

    #[error("Agent phase '{phase_id}' failed: {message}")]
    AgentFailed { phase_id: String, message: String },

    #[error("Gate '{phase_id}' did not pass: {reason}")]
    GateFailed { phase_id: String, reason: String },

    #[error("Phase '{phase_id}' was rejected: {reason}")]
    ApprovalRejected { phase_id: String, reason: String },

    #[error("An approval is already pending for phase '{0}'")]
    ApprovalAlreadyPending(String),

    #[error("Sub-workflow '{child_instance_id}' failed: {message}")]
    SubWorkflowFailed { child_instance_id: String, message: String },

    #[error("Workflow stopped by user")]
    Stopped,

    #[error("Workflow execution panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// 编排层自身错误的分类规则（优先于默认表）
pub const WORKFLOW_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        context: None,
        keywords: &["stopped by user"],
        code: "WORKFLOW_STOPPED",
        category: ErrorCategory::Validation,
        severity: Severity::Low,
        retry_policy: RetryPolicy::None,
        actions: &[],
        message: "The workflow was stopped by a user",
    },
    ClassificationRule {
        context: None,
        keywords: &["was rejected"],
        code: "APPROVAL_REJECTED",
        category: ErrorCategory::Validation,
        severity: Severity::Low,
        retry_policy: RetryPolicy::UserIntervention,
        actions: &[RecoveryAction::ReviewInput],
        message: "A required approval was rejected",
    },
    ClassificationRule {
        context: None,
        keywords: &["did not pass"],
        code: "GATE_FAILED",
        category: ErrorCategory::Validation,
        severity: Severity::Medium,
        retry_policy: RetryPolicy::None,
        actions: &[RecoveryAction::ReviewInput],
        message: "A gate condition was not satisfied",
    },
    ClassificationRule {
        context: None,
        keywords: &["is locked by another instance"],
        code: "VERSION_LOCKED",
        category: ErrorCategory::ResourceExhaustion,
        severity: Severity::Medium,
        retry_policy: RetryPolicy::RetryWithBackoff,
        actions: &[RecoveryAction::WaitAndRetry],
        message: "Another instance is running this workflow version",
    },
];

impl WorkflowError {
    /// 分类：RPC 错误按远程调用上下文，其余按通用上下文
    pub fn classified(&self) -> ClassifiedError {
        match self {
            Self::Rpc(e) => e.classified(),
            other => ErrorClassifier::new()
                .with_rules(WORKFLOW_RULES)
                .classify(other, ErrorContext::General),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_kind_wire_names() {
        let kinds: Vec<PhaseKind> =
            serde_json::from_value(json!(["agent", "gate", "user-approval", "subworkflow", "loop"]))
                .unwrap();
        assert_eq!(kinds[2], PhaseKind::UserApproval);
        assert_eq!(kinds[3], PhaseKind::SubWorkflow);
    }

    #[test]
    fn test_definition_defaults() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "id": "d", "version": 1,
            "phases": [{"id": "a", "name": "A", "kind": "user-approval", "requires_approval": true}]
        }))
        .unwrap();
        assert!(def.phases[0].requires_approval);
        assert!(def.phases[0].capability_ref.is_none());
        assert!(def.capabilities.is_empty());
        assert_eq!(def.phase("a").map(|p| p.kind), Some(PhaseKind::UserApproval));
    }

    #[test]
    fn test_stop_and_rejection_classification() {
        let stopped = WorkflowError::Stopped.classified();
        assert_eq!(stopped.code, "WORKFLOW_STOPPED");
        assert!(!stopped.is_retriable());

        let rejected = WorkflowError::ApprovalRejected {
            phase_id: "p2".into(),
            reason: "needs more detail".into(),
        }
        .classified();
        assert_eq!(rejected.code, "APPROVAL_REJECTED");
        assert!(!rejected.suggested_actions().is_empty());
    }

    #[test]
    fn test_agent_failure_uses_message_text() {
        let err = WorkflowError::AgentFailed {
            phase_id: "p1".into(),
            message: "429 Too Many Requests".into(),
        };
        assert_eq!(err.classified().code, "RATE_LIMITED");
    }

    #[test]
    fn test_rpc_failure_uses_rpc_context() {
        let err = WorkflowError::from(RpcError::ProcessExited {
            tool: "lock_workflow_version".into(),
            reason: "exit status: 1".into(),
        });
        assert_eq!(err.classified().code, "RPC_WORKER_EXITED");
        let failure = InstanceFailure::from_classified(&err.classified(), Some("p1".into()));
        assert_eq!(failure.phase_id.as_deref(), Some("p1"));
        assert!(failure.suggested_actions.contains(&"Restart the worker process".to_string()));
    }
}
