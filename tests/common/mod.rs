//! 集成测试共用的替身：内存版存储与脚本化能力执行器

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use phaseflow::rpc::{RpcError, ToolCaller};
use phaseflow::workflow::{
    CapabilityExecutor, CapabilityRequest, CapabilityResult, ExecutionStatus, WorkflowDefinition, WorkflowError,
    WorkflowExecutionState, WorkflowExecutor,
};
use serde_json::{json, Value};

/// 内存版定义存储：记录每次工具调用
pub struct MockStore {
    definitions: HashMap<String, WorkflowDefinition>,
    calls: Mutex<Vec<(String, Value)>>,
    lock_granted: bool,
    /// 子实例查询时返回的状态
    child_status: Mutex<String>,
    next_instance: Mutex<u64>,
    /// (definition_id, version) -> 持锁实例
    locks: Mutex<HashMap<(String, u64), String>>,
    /// 剩余需要失败的 unlock 次数
    unlock_failures: Mutex<u32>,
}

impl MockStore {
    pub fn new(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        Self {
            definitions: definitions.into_iter().map(|d| (d.id.clone(), d)).collect(),
            calls: Mutex::new(Vec::new()),
            lock_granted: true,
            child_status: Mutex::new("completed".to_string()),
            next_instance: Mutex::new(0),
            locks: Mutex::new(HashMap::new()),
            unlock_failures: Mutex::new(0),
        }
    }

    /// 前 n 次 unlock 以熔断打开的错误失败
    pub fn fail_unlocks(self, n: u32) -> Self {
        *self.unlock_failures.lock().unwrap() = n;
        self
    }

    pub fn held_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn deny_lock(mut self) -> Self {
        self.lock_granted = false;
        self
    }

    pub fn set_child_status(&self, status: &str) {
        *self.child_status.lock().unwrap() = status.to_string();
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, tool: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(name, _)| name == tool).count()
    }

    /// update_phase_execution 的 (phase_id, status) 序列
    pub fn phase_updates(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == "update_phase_execution")
            .map(|(_, args)| {
                (
                    args["phase_id"].as_str().unwrap_or_default().to_string(),
                    args["status"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl ToolCaller for MockStore {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        self.calls.lock().unwrap().push((name.to_string(), arguments.clone()));
        match name {
            "get_workflow_definition" => {
                let id = arguments["definition_id"].as_str().unwrap_or_default();
                let def = self.definitions.get(id).ok_or_else(|| RpcError::Remote {
                    tool: name.to_string(),
                    message: format!("Workflow definition not found: {id}"),
                })?;
                Ok(json!({ "definition": def }))
            }
            "create_workflow_instance" | "start_sub_workflow" => {
                let mut next = self.next_instance.lock().unwrap();
                *next += 1;
                Ok(json!({ "instance_id": format!("inst-{next}") }))
            }
            "lock_workflow_version" => {
                let key = version_key(&arguments);
                let holder = arguments["instance_id"].as_str().unwrap_or_default().to_string();
                let mut locks = self.locks.lock().unwrap();
                let free = locks.get(&key).map_or(true, |h| *h == holder);
                if self.lock_granted && free {
                    locks.insert(key, holder);
                    Ok(json!({ "locked": true }))
                } else {
                    Ok(json!({ "locked": false }))
                }
            }
            "unlock_workflow_version" => {
                {
                    let mut failures = self.unlock_failures.lock().unwrap();
                    if *failures > 0 {
                        *failures -= 1;
                        return Err(RpcError::CircuitOpen { retry_after_ms: 10 });
                    }
                }
                self.locks.lock().unwrap().remove(&version_key(&arguments));
                Ok(json!({ "unlocked": true }))
            }
            "get_workflow_instance" => Ok(json!({
                "instance_id": arguments["instance_id"],
                "status": self.child_status.lock().unwrap().clone(),
                "error": "child phase exploded",
            })),
            _ => Ok(json!({ "ok": true })),
        }
    }
}

fn version_key(arguments: &Value) -> (String, u64) {
    (
        arguments["definition_id"].as_str().unwrap_or_default().to_string(),
        arguments["version"].as_u64().unwrap_or_default(),
    )
}

/// 按能力名返回预设结果；未配置的能力返回成功
#[derive(Default)]
pub struct ScriptedCapabilities {
    scripted: HashMap<String, CapabilityResult>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CapabilityRequest>>,
}

impl ScriptedCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, capability: &str, result: CapabilityResult) -> Self {
        self.scripted.insert(capability.to_string(), result);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<CapabilityRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapabilityExecutor for ScriptedCapabilities {
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResult, WorkflowError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .scripted
            .get(&request.capability_ref)
            .cloned()
            .unwrap_or_else(|| CapabilityResult::ok(json!({ "phase": request.phase_id }))))
    }
}

/// 轮询直到实例满足条件
pub async fn wait_for<F>(executor: &WorkflowExecutor, instance_id: &str, pred: F) -> WorkflowExecutionState
where
    F: Fn(&WorkflowExecutionState) -> bool,
{
    for _ in 0..400 {
        if let Some(state) = executor.get_state(instance_id).await {
            if pred(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("instance {instance_id} did not reach the expected state");
}

pub async fn wait_terminal(executor: &WorkflowExecutor, instance_id: &str) -> WorkflowExecutionState {
    wait_for(executor, instance_id, |s| s.status.is_terminal()).await
}

pub async fn wait_paused(executor: &WorkflowExecutor, instance_id: &str) -> WorkflowExecutionState {
    wait_for(executor, instance_id, |s| s.status == ExecutionStatus::Paused).await
}
