//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PHASEFLOW__*` 覆盖（双下划线表示嵌套，如 `PHASEFLOW__WORKER__PROGRAM=./worker`）。
//! 各段只负责转换成组件的运行参数，组件本身不读文件。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::retry::RetryOptions;
use crate::rpc::WorkerConfig;
use crate::workflow::{ExecutorConfig, SubWorkflowMode};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerSection,
    pub retry: RetrySection,
    pub circuit_breaker: CircuitBreakerSection,
    pub orchestrator: OrchestratorSection,
}

/// [worker] 段：Worker 可执行文件、环境与超时
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// 存储连接串；未设置时读取 store_url_env 指定的环境变量
    pub store_url: Option<String>,
    #[serde(default = "default_store_url_env")]
    pub store_url_env: String,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_restart_initial_delay_ms")]
    pub restart_initial_delay_ms: u64,
    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_program() -> String {
    "phaseflow-worker".to_string()
}

fn default_store_url_env() -> String {
    "PHASEFLOW_STORE_URL".to_string()
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_restart_initial_delay_ms() -> u64 {
    1_000
}

fn default_restart_max_delay_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            env: HashMap::new(),
            store_url: None,
            store_url_env: default_store_url_env(),
            call_timeout_ms: default_call_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            restart_initial_delay_ms: default_restart_initial_delay_ms(),
            restart_max_delay_ms: default_restart_max_delay_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl WorkerSection {
    pub fn to_worker_config(&self) -> WorkerConfig {
        let mut cfg = WorkerConfig::new(self.program.clone());
        cfg.args = self.args.clone();
        cfg.env = self.env.clone();
        cfg.store_url = self.store_url.clone();
        cfg.store_url_env = self.store_url_env.clone();
        cfg.call_timeout = Duration::from_millis(self.call_timeout_ms);
        cfg.startup_timeout = Duration::from_millis(self.startup_timeout_ms);
        cfg.restart_initial_delay = Duration::from_millis(self.restart_initial_delay_ms);
        cfg.restart_max_delay = Duration::from_millis(self.restart_max_delay_ms);
        cfg.shutdown_grace = Duration::from_millis(self.shutdown_grace_ms);
        cfg
    }
}

/// [retry] 段：RPC 调用级重试
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_per_attempt_timeout_ms() -> u64 {
    300_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
            per_attempt_timeout: Duration::from_millis(self.per_attempt_timeout_ms),
            ..RetryOptions::default()
        }
    }
}

/// [circuit_breaker] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_monitoring_window_ms")]
    pub monitoring_window_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_success_threshold() -> u32 {
    2
}

fn default_monitoring_window_ms() -> u64 {
    120_000
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
            monitoring_window_ms: default_monitoring_window_ms(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            success_threshold: self.success_threshold,
            monitoring_window: Duration::from_millis(self.monitoring_window_ms),
        }
    }
}

/// [orchestrator] 段：实例清理与子工作流策略
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_eviction_delay_secs")]
    pub eviction_delay_secs: u64,
    #[serde(default)]
    pub sub_workflow_mode: SubWorkflowMode,
    #[serde(default = "default_sub_workflow_poll_ms")]
    pub sub_workflow_poll_ms: u64,
    #[serde(default = "default_unlock_retry_initial_ms")]
    pub unlock_retry_initial_ms: u64,
    #[serde(default = "default_unlock_retry_max_ms")]
    pub unlock_retry_max_ms: u64,
}

fn default_eviction_delay_secs() -> u64 {
    300
}

fn default_sub_workflow_poll_ms() -> u64 {
    1_000
}

fn default_unlock_retry_initial_ms() -> u64 {
    1_000
}

fn default_unlock_retry_max_ms() -> u64 {
    30_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            eviction_delay_secs: default_eviction_delay_secs(),
            sub_workflow_mode: SubWorkflowMode::default(),
            sub_workflow_poll_ms: default_sub_workflow_poll_ms(),
            unlock_retry_initial_ms: default_unlock_retry_initial_ms(),
            unlock_retry_max_ms: default_unlock_retry_max_ms(),
        }
    }
}

impl OrchestratorSection {
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            eviction_delay: Duration::from_secs(self.eviction_delay_secs),
            sub_workflow_mode: self.sub_workflow_mode,
            sub_workflow_poll: Duration::from_millis(self.sub_workflow_poll_ms),
            unlock_retry_initial: Duration::from_millis(self.unlock_retry_initial_ms),
            unlock_retry_max: Duration::from_millis(self.unlock_retry_max_ms),
        }
    }
}

/// 从 config 目录加载配置，环境变量 PHASEFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PHASEFLOW__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PHASEFLOW")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.worker.program, "phaseflow-worker");
        assert_eq!(cfg.worker.call_timeout_ms, 30_000);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.orchestrator.sub_workflow_mode, SubWorkflowMode::Detached);

        let worker = cfg.worker.to_worker_config();
        assert_eq!(worker.restart_max_delay, Duration::from_secs(30));
        let retry = cfg.retry.to_retry_options();
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(2000));
        let executor = cfg.orchestrator.to_executor_config();
        assert_eq!(executor.eviction_delay, Duration::from_secs(300));
        assert_eq!(executor.unlock_retry_max, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[worker]
program = "/opt/phaseflow/worker"
args = ["--stdio"]
call_timeout_ms = 5000

[worker.env]
phaseflow_mode = "demo"

[circuit_breaker]
failure_threshold = 2

[orchestrator]
sub_workflow_mode = "await_child"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.worker.program, "/opt/phaseflow/worker");
        assert_eq!(cfg.worker.args, vec!["--stdio".to_string()]);
        assert_eq!(cfg.worker.call_timeout_ms, 5000);
        assert_eq!(cfg.worker.startup_timeout_ms, 10_000);
        assert_eq!(cfg.worker.env.get("phaseflow_mode").map(String::as_str), Some("demo"));
        assert_eq!(cfg.circuit_breaker.failure_threshold, 2);
        assert_eq!(cfg.circuit_breaker.success_threshold, 2);
        assert_eq!(cfg.retry.initial_delay_ms, 1_000);
        assert_eq!(cfg.orchestrator.sub_workflow_mode, SubWorkflowMode::AwaitChild);
    }
}
