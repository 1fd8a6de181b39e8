//! 工作流定义构建器
//!
//! 提供流畅的API来构建工作流定义

use std::collections::HashSet;

use crate::workflow::types::*;

/// 工作流定义构建器
pub struct WorkflowBuilder {
    id: String,
    version: u32,
    name: String,
    description: Option<String>,
    phases: Vec<Phase>,
    capabilities: Vec<String>,
}

impl WorkflowBuilder {
    /// 创建新的构建器（版本默认为 1）
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            name: String::new(),
            description: None,
            phases: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 设置描述
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// 追加阶段（按追加顺序执行）
    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// 追加 agent 阶段，并把能力登记到依赖列表
    pub fn agent(mut self, id: impl Into<String>, name: impl Into<String>, capability: impl Into<String>) -> Self {
        let phase = Phase::agent(id, name, capability);
        if let Some(cap) = &phase.capability_ref {
            if !self.capabilities.contains(cap) {
                self.capabilities.push(cap.clone());
            }
        }
        self.phases.push(phase);
        self
    }

    /// 追加需要人工审批的阶段
    pub fn approval(self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.phase(Phase::approval(id, name))
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// 构建定义
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        if self.id.trim().is_empty() {
            return Err(WorkflowError::InvalidConfiguration("workflow id is required".to_string()));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.id.trim().is_empty() {
                return Err(WorkflowError::InvalidConfiguration("phase id is required".to_string()));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(WorkflowError::InvalidConfiguration(format!(
                    "duplicate phase id '{}'",
                    phase.id
                )));
            }
        }

        let name = if self.name.is_empty() { self.id.clone() } else { self.name };
        Ok(WorkflowDefinition {
            id: self.id,
            version: self.version,
            name,
            description: self.description,
            phases: self.phases,
            capabilities: self.capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_workflow() {
        let workflow = WorkflowBuilder::new("review")
            .name("Review")
            .description("A test workflow")
            .agent("draft", "Draft", "writer")
            .approval("approve", "Approve draft")
            .agent("publish", "Publish", "writer")
            .build()
            .expect("Failed to build workflow");

        assert_eq!(workflow.name, "Review");
        assert_eq!(workflow.phases.len(), 3);
        assert_eq!(workflow.phases[1].kind, PhaseKind::UserApproval);
        assert!(workflow.phases[1].requires_approval);
        assert_eq!(workflow.capabilities, vec!["writer".to_string()]);
    }

    #[test]
    fn test_build_without_id_fails() {
        let result = WorkflowBuilder::new("  ").build();

        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_phase_ids_rejected() {
        let result = WorkflowBuilder::new("w")
            .agent("a", "A", "x")
            .approval("a", "Again")
            .build();
        assert!(matches!(result, Err(WorkflowError::InvalidConfiguration(msg)) if msg.contains("duplicate")));
    }
}
