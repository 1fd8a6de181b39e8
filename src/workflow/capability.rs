//! 能力执行器：agent 阶段的外部协作者
//!
//! 执行器被当作不透明的长耗时调用，会话管理由它自己负责。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::rpc::ToolCaller;
use crate::workflow::types::{Phase, WorkflowDefinition, WorkflowError};

pub const EXECUTE_CAPABILITY_TOOL: &str = "execute_capability";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub capability_ref: String,
    pub instance_id: String,
    pub phase_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl CapabilityResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            session_id: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            session_id: None,
        }
    }
}

#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResult, WorkflowError>;
}

/// 由阶段元数据拼出提示词；有上一阶段输出时附在末尾
pub fn build_prompt(definition: &WorkflowDefinition, phase: &Phase, previous_output: Option<&Value>) -> String {
    let mut prompt = format!("Workflow: {}\nPhase: {}", display_name(definition), phase.name);
    if !phase.description.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&phase.description);
    }
    if let Some(output) = previous_output.filter(|v| !v.is_null()) {
        prompt.push_str("\n\nPrevious phase output:\n");
        prompt.push_str(&output.to_string());
    }
    prompt
}

fn display_name(definition: &WorkflowDefinition) -> &str {
    if definition.name.is_empty() {
        &definition.id
    } else {
        &definition.name
    }
}

/// 通过 Worker 的 `execute_capability` 工具执行
pub struct RpcCapabilityExecutor {
    caller: Arc<dyn ToolCaller>,
}

impl RpcCapabilityExecutor {
    pub fn new(caller: Arc<dyn ToolCaller>) -> Self {
        Self { caller }
    }
}

#[async_trait]
impl CapabilityExecutor for RpcCapabilityExecutor {
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResult, WorkflowError> {
        let args = json!({
            "capability_ref": request.capability_ref,
            "instance_id": request.instance_id,
            "phase_id": request.phase_id,
            "prompt": request.prompt,
            "context": request.context,
        });
        let value = self.caller.call_tool(EXECUTE_CAPABILITY_TOOL, args).await?;
        match serde_json::from_value::<CapabilityResult>(value.clone()) {
            Ok(result) => Ok(result),
            // 工具直接返回产出时视为成功
            Err(_) => Ok(CapabilityResult::ok(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcError;
    use crate::workflow::types::PhaseKind;
    use std::sync::Mutex;

    #[test]
    fn test_prompt_includes_metadata_and_previous_output() {
        let def = WorkflowDefinition {
            id: "release".into(),
            version: 1,
            name: "Release".into(),
            description: None,
            phases: vec![],
            capabilities: vec![],
        };
        let phase = Phase::agent("notes", "Write notes", "writer").with_description("Summarize the changes.");
        let prompt = build_prompt(&def, &phase, Some(&json!({"commits": 3})));
        assert!(prompt.starts_with("Workflow: Release\nPhase: Write notes"));
        assert!(prompt.contains("Summarize the changes."));
        assert!(prompt.contains("{\"commits\":3}"));

        let bare = Phase::new("g", "Gate", PhaseKind::Gate);
        let def = WorkflowDefinition { name: String::new(), ..def };
        assert_eq!(build_prompt(&def, &bare, None), "Workflow: release\nPhase: Gate");
    }

    struct Fixed(Value, Mutex<Option<Value>>);

    #[async_trait]
    impl ToolCaller for Fixed {
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
            assert_eq!(name, EXECUTE_CAPABILITY_TOOL);
            *self.1.lock().unwrap() = Some(arguments);
            Ok(self.0.clone())
        }
    }

    fn request() -> CapabilityRequest {
        CapabilityRequest {
            capability_ref: "writer".into(),
            instance_id: "i1".into(),
            phase_id: "p1".into(),
            prompt: "hello".into(),
            context: None,
        }
    }

    #[tokio::test]
    async fn test_rpc_executor_decodes_result() {
        let caller = Arc::new(Fixed(
            json!({"success": false, "error": "model refused", "session_id": "s1"}),
            Mutex::new(None),
        ));
        let exec = RpcCapabilityExecutor::new(caller.clone());
        let result = exec.execute(request()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("model refused"));
        let sent = caller.1.lock().unwrap().clone().unwrap();
        assert_eq!(sent["capability_ref"], "writer");
        assert_eq!(sent["prompt"], "hello");
    }

    #[tokio::test]
    async fn test_rpc_executor_wraps_plain_output() {
        let caller = Arc::new(Fixed(json!("done"), Mutex::new(None)));
        let result = RpcCapabilityExecutor::new(caller).execute(request()).await.unwrap();
        assert_eq!(result, CapabilityResult::ok(json!("done")));
    }
}
