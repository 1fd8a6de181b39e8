//! phaseflow-worker：按行收发 JSON 的参考 Worker
//!
//! 提供内存版定义存储（含 demo-release / demo-child 两个定义）、`execute_capability`，
//! 以及供客户端测试使用的工具：echo、delay、fail、text、noise、pid、env、crash。
//! 每个请求在独立任务中处理，响应可以乱序返回。stdout 只写协议行，日志走 stderr。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use phaseflow::observability;
use phaseflow::rpc::protocol::{RpcRequest, RpcResponse, TOOLS_CALL_METHOD};
use phaseflow::rpc::store::tools;
use phaseflow::workflow::capability::EXECUTE_CAPABILITY_TOOL;
use phaseflow::workflow::{Phase, WorkflowBuilder, WorkflowDefinition};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use uuid::Uuid;

/// 内存版存储
#[derive(Default)]
struct Store {
    definitions: HashMap<String, Vec<WorkflowDefinition>>,
    instances: HashMap<String, Value>,
    /// (definition_id, version) -> 持有锁的实例
    locks: HashMap<(String, u32), String>,
}

impl Store {
    fn seeded() -> anyhow::Result<Self> {
        let mut store = Self::default();
        let release = WorkflowBuilder::new("demo-release")
            .name("Demo release")
            .description("Prepare, check, approve and publish a release")
            .agent("draft", "Draft release notes", "writer")
            .phase(Phase::gate("checks", "Release checks", "all_checks_green"))
            .approval("sign-off", "Release sign-off")
            .phase(Phase::sub_workflow("announce", "Announce", "demo-child"))
            .agent("publish", "Publish", "publisher")
            .build()?;
        let child = WorkflowBuilder::new("demo-child")
            .name("Announcement")
            .agent("post", "Post announcement", "writer")
            .build()?;
        for def in [release, child] {
            store.definitions.entry(def.id.clone()).or_default().push(def);
        }
        Ok(store)
    }

    fn new_instance(&mut self, record: Value) -> String {
        let id = format!("inst-{}", Uuid::new_v4());
        let mut record = record;
        record["instance_id"] = json!(id);
        self.instances.insert(id.clone(), record);
        id
    }

    fn call(&mut self, tool: &str, args: &Value) -> Result<Value, String> {
        match tool {
            tools::GET_WORKFLOW_DEFINITION => {
                let id = str_arg(args, "definition_id")?;
                let versions = self
                    .definitions
                    .get(id)
                    .ok_or_else(|| format!("Workflow definition not found: {id}"))?;
                let def = match args.get("version").and_then(Value::as_u64) {
                    Some(v) => versions.iter().find(|d| u64::from(d.version) == v),
                    None => versions.iter().max_by_key(|d| d.version),
                }
                .ok_or_else(|| format!("Workflow definition version not found: {id}"))?;
                serde_json::to_value(def).map_err(|e| e.to_string())
            }
            tools::CREATE_WORKFLOW_INSTANCE => {
                let id = self.new_instance(json!({
                    "definition_id": args.get("definition_id"),
                    "version": args.get("version"),
                    "owner_ids": args.get("owner_ids"),
                    "status": "running",
                    "phases": {},
                }));
                Ok(json!({ "instance_id": id }))
            }
            tools::LOCK_WORKFLOW_VERSION => {
                let key = version_key(args)?;
                let instance_id = str_arg(args, "instance_id")?.to_string();
                match self.locks.get(&key).cloned() {
                    Some(holder) if holder != instance_id => Ok(json!({ "locked": false, "holder": holder })),
                    _ => {
                        self.locks.insert(key, instance_id);
                        Ok(json!({ "locked": true }))
                    }
                }
            }
            tools::UNLOCK_WORKFLOW_VERSION => {
                let key = version_key(args)?;
                let instance_id = str_arg(args, "instance_id")?;
                if self.locks.get(&key).map(String::as_str) == Some(instance_id) {
                    self.locks.remove(&key);
                }
                Ok(json!({ "unlocked": true }))
            }
            tools::UPDATE_PHASE_EXECUTION => {
                let instance_id = str_arg(args, "instance_id")?;
                let phase_id = str_arg(args, "phase_id")?;
                let record = self
                    .instances
                    .get_mut(instance_id)
                    .ok_or_else(|| format!("Workflow instance not found: {instance_id}"))?;
                record["phases"][phase_id] = args.clone();
                if args.get("status").and_then(Value::as_str) == Some("failed") {
                    record["status"] = json!("failed");
                    record["error"] = args.get("error").cloned().unwrap_or(Value::Null);
                }
                Ok(json!({ "ok": true }))
            }
            tools::START_SUB_WORKFLOW => {
                let definition_ref = str_arg(args, "definition_ref")?;
                if !self.definitions.contains_key(definition_ref) {
                    return Err(format!("Workflow definition not found: {definition_ref}"));
                }
                // 子实例不在本进程内执行，直接记为已完成
                let id = self.new_instance(json!({
                    "definition_id": definition_ref,
                    "parent_instance_id": args.get("parent_instance_id"),
                    "status": "completed",
                }));
                Ok(json!({ "instance_id": id }))
            }
            tools::GET_WORKFLOW_INSTANCE => {
                let instance_id = str_arg(args, "instance_id")?;
                let record = self
                    .instances
                    .get(instance_id)
                    .ok_or_else(|| format!("Workflow instance not found: {instance_id}"))?;
                Ok(json!({
                    "instance_id": instance_id,
                    "status": record.get("status").cloned().unwrap_or(json!("running")),
                    "error": record.get("error").cloned().unwrap_or(Value::Null),
                }))
            }
            _ => Err(format!("Unknown tool: {tool}")),
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("Missing argument: {key}"))
}

fn version_key(args: &Value) -> Result<(String, u32), String> {
    let id = str_arg(args, "definition_id")?.to_string();
    let version = args
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| "Missing argument: version".to_string())?;
    Ok((id, version as u32))
}

struct Worker {
    store: Mutex<Store>,
    stdout: Mutex<Stdout>,
}

impl Worker {
    async fn write_line(&self, line: &str) {
        let mut out = self.stdout.lock().await;
        let written = async {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(error = %e, "Failed to write to stdout");
        }
    }

    async fn respond(&self, response: RpcResponse) {
        match serde_json::to_string(&response) {
            Ok(line) => self.write_line(&line).await,
            Err(e) => tracing::error!(id = response.id, error = %e, "Failed to encode response"),
        }
    }

    async fn handle(&self, request: RpcRequest) {
        let id = request.id;
        if request.method != TOOLS_CALL_METHOD {
            self.respond(RpcResponse::failure(id, format!("Unknown method: {}", request.method)))
                .await;
            return;
        }
        let tool = request.params.name.as_str();
        let args = request.params.arguments;
        tracing::debug!(id, tool, "Handling tool call");

        let response = match tool {
            "echo" => RpcResponse::success(id, args),
            "text" => {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                RpcResponse::text(id, text)
            }
            "delay" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                RpcResponse::success(id, json!({ "slept_ms": ms, "value": args.get("value") }))
            }
            "fail" => {
                let message = args.get("message").and_then(Value::as_str).unwrap_or("requested failure");
                RpcResponse::failure(id, message)
            }
            "noise" => {
                self.write_line("worker diagnostic: not a response").await;
                self.write_line("{\"unrelated\": true}").await;
                RpcResponse::success(id, json!({ "ok": true }))
            }
            "pid" => RpcResponse::success(id, json!({ "pid": std::process::id() })),
            "env" => {
                let key = args.get("key").and_then(Value::as_str).unwrap_or_default();
                RpcResponse::success(id, json!({ "value": std::env::var(key).ok() }))
            }
            "crash" => {
                let code = args.get("code").and_then(Value::as_i64).unwrap_or(1) as i32;
                tracing::warn!(code, "Crashing on request");
                std::process::exit(code);
            }
            EXECUTE_CAPABILITY_TOOL => execute_capability(id, &args),
            _ => {
                let result = self.store.lock().await.call(tool, &args);
                match result {
                    Ok(value) => RpcResponse::text(id, value.to_string()),
                    Err(message) => RpcResponse::failure(id, message),
                }
            }
        };
        self.respond(response).await;
    }
}

/// 能力以 "fail" 开头时返回失败结果，其余返回提示词摘要
fn execute_capability(id: u64, args: &Value) -> RpcResponse {
    let capability = args.get("capability_ref").and_then(Value::as_str).unwrap_or_default();
    let phase_id = args.get("phase_id").and_then(Value::as_str).unwrap_or_default();
    if capability.starts_with("fail") {
        return RpcResponse::success(
            id,
            json!({ "success": false, "error": format!("capability '{capability}' failed") }),
        );
    }
    let prompt = args.get("prompt").and_then(Value::as_str).unwrap_or_default();
    RpcResponse::success(
        id,
        json!({
            "success": true,
            "output": { "capability": capability, "phase_id": phase_id, "prompt_chars": prompt.chars().count() },
            "session_id": format!("session-{phase_id}"),
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_stderr();
    tracing::info!(pid = std::process::id(), "Worker ready");

    let worker = Arc::new(Worker {
        store: Mutex::new(Store::seeded()?),
        stdout: Mutex::new(tokio::io::stdout()),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move { worker.handle(request).await });
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed request"),
        }
    }

    tracing::info!("Stdin closed, exiting");
    Ok(())
}
