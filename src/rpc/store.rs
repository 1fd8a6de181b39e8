//! 工作流定义存储（经 Worker 工具调用代理）
//!
//! 只负责参数整形与结果解码，不持有任何状态。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::rpc::{RpcError, ToolCaller};
use crate::workflow::types::{ExecutionStatus, WorkflowDefinition};

/// Worker 侧工具名
pub mod tools {
    pub const GET_WORKFLOW_DEFINITION: &str = "get_workflow_definition";
    pub const CREATE_WORKFLOW_INSTANCE: &str = "create_workflow_instance";
    pub const LOCK_WORKFLOW_VERSION: &str = "lock_workflow_version";
    pub const UNLOCK_WORKFLOW_VERSION: &str = "unlock_workflow_version";
    pub const UPDATE_PHASE_EXECUTION: &str = "update_phase_execution";
    pub const START_SUB_WORKFLOW: &str = "start_sub_workflow";
    pub const GET_WORKFLOW_INSTANCE: &str = "get_workflow_instance";
}

/// 阶段执行记录的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseExecutionStatus {
    Running,
    WaitingApproval,
    Completed,
    Failed,
}

/// update_phase_execution 的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseExecutionUpdate {
    pub instance_id: String,
    pub phase_id: String,
    pub status: PhaseExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseExecutionUpdate {
    pub fn new(instance_id: &str, phase_id: &str, status: PhaseExecutionStatus) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            phase_id: phase_id.to_string(),
            status,
            output: None,
            error: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// 持久化实例的状态快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct DefinitionStore {
    caller: Arc<dyn ToolCaller>,
}

impl DefinitionStore {
    pub fn new(caller: Arc<dyn ToolCaller>) -> Self {
        Self { caller }
    }

    /// 读取定义；未指定版本时由存储返回最新版本
    pub async fn get_definition(
        &self,
        definition_id: &str,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition, RpcError> {
        let mut args = json!({ "definition_id": definition_id });
        if let Some(v) = version {
            args["version"] = json!(v);
        }
        let value = self.caller.call_tool(tools::GET_WORKFLOW_DEFINITION, args).await?;
        let value = match value {
            Value::Object(mut map) if map.contains_key("definition") => {
                map.remove("definition").unwrap_or(Value::Null)
            }
            other => other,
        };
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("invalid workflow definition '{definition_id}': {e}")))
    }

    /// 创建持久化实例记录，返回实例 id
    pub async fn create_instance(
        &self,
        definition_id: &str,
        version: u32,
        owner_ids: &[String],
        start_phase: usize,
    ) -> Result<String, RpcError> {
        let value = self
            .caller
            .call_tool(
                tools::CREATE_WORKFLOW_INSTANCE,
                json!({
                    "definition_id": definition_id,
                    "version": version,
                    "owner_ids": owner_ids,
                    "start_phase": start_phase,
                }),
            )
            .await?;
        instance_id_from(value, tools::CREATE_WORKFLOW_INSTANCE)
    }

    /// 获取版本独占锁；已被其他实例持有时返回 false
    pub async fn lock_version(
        &self,
        definition_id: &str,
        version: u32,
        instance_id: &str,
    ) -> Result<bool, RpcError> {
        let value = self
            .caller
            .call_tool(
                tools::LOCK_WORKFLOW_VERSION,
                json!({ "definition_id": definition_id, "version": version, "instance_id": instance_id }),
            )
            .await?;
        Ok(value.get("locked").and_then(Value::as_bool).unwrap_or(true))
    }

    pub async fn unlock_version(
        &self,
        definition_id: &str,
        version: u32,
        instance_id: &str,
    ) -> Result<(), RpcError> {
        self.caller
            .call_tool(
                tools::UNLOCK_WORKFLOW_VERSION,
                json!({ "definition_id": definition_id, "version": version, "instance_id": instance_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn update_phase_execution(&self, update: &PhaseExecutionUpdate) -> Result<(), RpcError> {
        let args = serde_json::to_value(update)?;
        self.caller.call_tool(tools::UPDATE_PHASE_EXECUTION, args).await?;
        Ok(())
    }

    /// 记录阶段完成及其原始结果
    pub async fn record_phase_result(
        &self,
        instance_id: &str,
        phase_id: &str,
        output: &Value,
    ) -> Result<(), RpcError> {
        let update = PhaseExecutionUpdate::new(instance_id, phase_id, PhaseExecutionStatus::Completed)
            .with_output(output.clone());
        self.update_phase_execution(&update).await
    }

    /// 创建子工作流实例，返回子实例 id
    pub async fn start_sub_workflow(
        &self,
        parent_instance_id: &str,
        phase_id: &str,
        definition_ref: &str,
    ) -> Result<String, RpcError> {
        let value = self
            .caller
            .call_tool(
                tools::START_SUB_WORKFLOW,
                json!({
                    "parent_instance_id": parent_instance_id,
                    "phase_id": phase_id,
                    "definition_ref": definition_ref,
                }),
            )
            .await?;
        instance_id_from(value, tools::START_SUB_WORKFLOW)
    }

    pub async fn get_instance_status(&self, instance_id: &str) -> Result<InstanceSnapshot, RpcError> {
        let value = self
            .caller
            .call_tool(tools::GET_WORKFLOW_INSTANCE, json!({ "instance_id": instance_id }))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("invalid instance record '{instance_id}': {e}")))
    }
}

/// 结果可以是 `{"instance_id": "..."}` 或裸字符串
fn instance_id_from(value: Value, tool: &str) -> Result<String, RpcError> {
    match &value {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => map
            .get("instance_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Protocol(format!("'{tool}' returned no instance_id: {value}"))),
        _ => Err(RpcError::Protocol(format!("'{tool}' returned no instance_id: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 记录调用并按工具名返回预设结果
    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
        reply: fn(&str) -> Value,
    }

    #[async_trait]
    impl ToolCaller for Recorder {
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
            self.calls.lock().unwrap().push((name.to_string(), arguments));
            Ok((self.reply)(name))
        }
    }

    fn store(reply: fn(&str) -> Value) -> (DefinitionStore, Arc<Recorder>) {
        let rec = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            reply,
        });
        (DefinitionStore::new(rec.clone()), rec)
    }

    #[tokio::test]
    async fn test_get_definition_decodes_wrapped_payload() {
        let (store, rec) = store(|_| {
            json!({"definition": {
                "id": "review", "version": 2, "name": "Review",
                "phases": [{"id": "p1", "name": "Draft", "kind": "agent", "capability_ref": "writer"}]
            }})
        });
        let def = store.get_definition("review", Some(2)).await.unwrap();
        assert_eq!(def.version, 2);
        assert_eq!(def.phases.len(), 1);
        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls[0].0, tools::GET_WORKFLOW_DEFINITION);
        assert_eq!(calls[0].1, json!({"definition_id": "review", "version": 2}));
    }

    #[tokio::test]
    async fn test_get_definition_without_version() {
        let (store, rec) = store(|_| json!({"id": "d", "version": 1, "phases": []}));
        store.get_definition("d", None).await.unwrap();
        assert_eq!(rec.calls.lock().unwrap()[0].1, json!({"definition_id": "d"}));
    }

    #[tokio::test]
    async fn test_bad_definition_is_protocol_error() {
        let (store, _) = store(|_| json!("nonsense"));
        let err = store.get_definition("d", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_create_instance_and_lock() {
        let (store, rec) = store(|tool| match tool {
            tools::CREATE_WORKFLOW_INSTANCE => json!({"instance_id": "inst-1"}),
            tools::LOCK_WORKFLOW_VERSION => json!({"locked": false}),
            _ => Value::Null,
        });
        let id = store
            .create_instance("d", 3, &["alice".to_string()], 0)
            .await
            .unwrap();
        assert_eq!(id, "inst-1");
        assert!(!store.lock_version("d", 3, &id).await.unwrap());
        let calls = rec.calls.lock().unwrap();
        assert_eq!(
            calls[0].1,
            json!({"definition_id": "d", "version": 3, "owner_ids": ["alice"], "start_phase": 0})
        );
        assert_eq!(calls[1].1, json!({"definition_id": "d", "version": 3, "instance_id": "inst-1"}));
    }

    #[tokio::test]
    async fn test_record_phase_result_shape() {
        let (store, rec) = store(|_| json!({"ok": true}));
        store
            .record_phase_result("i", "p", &json!({"answer": 42}))
            .await
            .unwrap();
        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls[0].0, tools::UPDATE_PHASE_EXECUTION);
        assert_eq!(
            calls[0].1,
            json!({"instance_id": "i", "phase_id": "p", "status": "completed", "output": {"answer": 42}})
        );
    }

    #[tokio::test]
    async fn test_instance_status_snapshot() {
        let (store, _) = store(|_| json!({"instance_id": "c", "status": "failed", "error": "boom"}));
        let snap = store.get_instance_status("c").await.unwrap();
        assert_eq!(snap.status, ExecutionStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_sub_workflow_accepts_bare_id() {
        let (store, _) = store(|_| json!("child-9"));
        let id = store.start_sub_workflow("parent", "p3", "child-def").await.unwrap();
        assert_eq!(id, "child-9");
    }
}
