//! 持久 Worker 客户端
//!
//! 同一时刻只持有一个存活的 Worker 进程，所有逻辑调用共用它的 stdin/stdout：
//! 请求按 id 登记到待决表，读任务按 id 把响应交还给等待方。
//! 进程退出时本代的所有待决调用立即被拒绝，并按退避延迟安排一次重启（关闭中除外）。
//! 后台任务只持有 Weak 引用，客户端被丢弃时 Worker 随之被杀死。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::rpc::protocol::{parse_response, LineBuffer, RpcRequest};
use crate::rpc::{RpcError, ToolCaller};

/// 其他调用方等待进行中的启动时的轮询间隔
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// 进程退出后等待读任务交付剩余响应的上限
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// 强杀后等待回收的上限
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Worker 进程参数
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// 显式指定的存储连接串，优先于环境变量
    pub store_url: Option<String>,
    /// 存储连接串所用的环境变量名（读取与传给 Worker 都用它）
    pub store_url_env: String,
    pub call_timeout: Duration,
    pub startup_timeout: Duration,
    pub restart_initial_delay: Duration,
    pub restart_max_delay: Duration,
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            store_url: None,
            store_url_env: "PHASEFLOW_STORE_URL".to_string(),
            call_timeout: Duration::from_millis(30_000),
            startup_timeout: Duration::from_millis(10_000),
            restart_initial_delay: Duration::from_millis(1_000),
            restart_max_delay: Duration::from_millis(30_000),
            shutdown_grace: Duration::from_millis(2_000),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    pub fn with_call_timeout(mut self, t: Duration) -> Self {
        self.call_timeout = t;
        self
    }

    pub fn with_restart_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.restart_initial_delay = initial;
        self.restart_max_delay = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// 存储连接串：显式配置优先，否则读取父进程环境变量
    pub fn resolved_store_url(&self) -> Option<String> {
        self.store_url
            .clone()
            .or_else(|| std::env::var(&self.store_url_env).ok())
            .filter(|s| !s.is_empty())
    }
}

struct PendingCall {
    tool: String,
    generation: u64,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

/// 一代 Worker 进程
struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    exited: Arc<AtomicBool>,
    exit_rx: watch::Receiver<bool>,
    /// 发送或丢弃都会让监管任务杀死进程
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// `writing` 在拿到 stdin 之后、整行写完之前为 true
    async fn write_line(&self, line: &str, writing: &AtomicBool) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin closed")
        })?;
        writing.store(true, Ordering::SeqCst);
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        writing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&self) {
        if let Some(tx) = lock(&self.kill_tx).take() {
            let _ = tx.send(());
        }
    }
}

struct ClientInner {
    config: WorkerConfig,
    worker: Mutex<Option<Arc<WorkerHandle>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
    generation: AtomicU64,
    starting: AtomicBool,
    shutting_down: AtomicBool,
    restart_scheduled: AtomicBool,
    restart_delay_ms: AtomicU64,
    restart_count: AtomicU32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// 离开作用域时移除对应的待决项（已被交付或拒绝时无操作）
struct PendingGuard<'a> {
    inner: &'a ClientInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.take_pending(self.id);
    }
}

/// 常驻 Worker 的 RPC 客户端（克隆共享同一个进程）
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(config: WorkerConfig) -> Self {
        let initial = millis(config.restart_initial_delay);
        Self {
            inner: Arc::new(ClientInner {
                config,
                worker: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                starting: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                restart_scheduled: AtomicBool::new(false),
                restart_delay_ms: AtomicU64::new(initial),
                restart_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// 确保 Worker 已启动；并发调用只会启动一个进程
    pub async fn start(&self) -> Result<(), RpcError> {
        self.inner.start().await
    }

    /// 调用 Worker 工具并等待对应 id 的响应
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        self.inner.call_tool(name, arguments).await
    }

    /// 优雅关闭：禁止重启、拒绝待决调用、关闭 stdin + SIGTERM，超过宽限期后强杀
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.current_worker().is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.current_worker().and_then(|h| h.pid)
    }

    /// 已启动过的进程代数（首个进程为 1）
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// 自动重启尝试次数
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }

    /// 下一次自动重启前的等待时长
    pub fn current_restart_delay(&self) -> Duration {
        Duration::from_millis(self.inner.restart_delay_ms.load(Ordering::SeqCst))
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("program", &self.inner.config.program)
            .field("generation", &self.generation())
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[async_trait]
impl ToolCaller for RpcClient {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        RpcClient::call_tool(self, name, arguments).await
    }
}

impl ClientInner {
    fn current_worker(&self) -> Option<Arc<WorkerHandle>> {
        lock(&self.worker).as_ref().filter(|h| h.is_alive()).cloned()
    }

    fn take_pending(&self, id: u64) -> Option<PendingCall> {
        lock(&self.pending).remove(&id)
    }

    async fn start(self: &Arc<Self>) -> Result<(), RpcError> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(RpcError::ShuttingDown);
            }
            if self.current_worker().is_some() {
                return Ok(());
            }
            if self
                .starting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let result = if self.current_worker().is_some() {
                    Ok(())
                } else {
                    self.spawn_worker()
                };
                self.starting.store(false, Ordering::SeqCst);
                if let Err(e) = &result {
                    tracing::error!(program = %self.config.program, error = %e, "Worker failed to start");
                    self.schedule_restart();
                }
                return result;
            }
            if Instant::now() >= deadline {
                return Err(RpcError::StartupTimeout(millis(self.config.startup_timeout)));
            }
            sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<(), RpcError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(url) = self.config.resolved_store_url() {
            cmd.env(&self.config.store_url_env, url);
        }

        let mut child = cmd.spawn().map_err(|e| RpcError::Spawn {
            program: self.config.program.clone(),
            message: e.to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Io("worker stdout was not captured".to_string()))?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();

        let handle = Arc::new(WorkerHandle {
            generation,
            pid,
            stdin: AsyncMutex::new(stdin),
            exited: exited.clone(),
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        });
        *lock(&self.worker) = Some(handle);

        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(read_stdout(weak.clone(), generation, stdout));
        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(generation, stderr));
        }
        tokio::spawn(supervise(weak, generation, child, exited, kill_rx, reader, exit_tx));

        tracing::info!(program = %self.config.program, generation, pid = ?pid, "Worker started");
        Ok(())
    }

    fn dispatch_line(&self, generation: u64, line: &str) {
        let Some(response) = parse_response(line) else {
            tracing::debug!(generation, line, "Discarding non-response worker output");
            return;
        };
        match self.take_pending(response.id) {
            Some(call) => {
                let result = response.into_result(&call.tool);
                let _ = call.tx.send(result);
            }
            None => {
                tracing::debug!(generation, id = response.id, "Ignoring response for unknown or timed-out request");
            }
        }
    }

    fn on_worker_exit(self: &Arc<Self>, generation: u64, reason: String) {
        {
            let mut worker = lock(&self.worker);
            if worker.as_ref().map(|h| h.generation) == Some(generation) {
                *worker = None;
            }
        }

        let rejected: Vec<PendingCall> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| call.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        let rejected_count = rejected.len();
        for call in rejected {
            let _ = call.tx.send(Err(RpcError::ProcessExited {
                tool: call.tool,
                reason: reason.clone(),
            }));
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::info!(generation, %reason, "Worker exited during shutdown");
            return;
        }
        tracing::warn!(generation, %reason, rejected = rejected_count, "Worker exited unexpectedly");
        self.schedule_restart();
    }

    /// 安排一次重启；已有重启在排队时不重复安排
    fn schedule_restart(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.restart_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let delay = match weak.upgrade() {
                    Some(inner) => Duration::from_millis(inner.restart_delay_ms.load(Ordering::SeqCst)),
                    None => return,
                };
                tracing::info!(delay_ms = millis(delay), "Scheduling worker restart");
                sleep(delay).await;

                let Some(inner) = weak.upgrade() else { return };
                if inner.shutting_down.load(Ordering::SeqCst) {
                    inner.restart_scheduled.store(false, Ordering::SeqCst);
                    return;
                }
                let attempt = inner.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
                match inner.start().await {
                    Ok(()) => {
                        inner.restart_delay_ms.store(
                            millis(inner.config.restart_initial_delay),
                            Ordering::SeqCst,
                        );
                        inner.restart_scheduled.store(false, Ordering::SeqCst);
                        tracing::info!(attempt, generation = inner.generation.load(Ordering::SeqCst), "Worker restarted");
                        // 重启后立刻又退出时，退出处理看到的是尚未清除的标志
                        if inner.current_worker().is_none() {
                            inner.schedule_restart();
                        }
                        return;
                    }
                    Err(e) => {
                        let current = inner.restart_delay_ms.load(Ordering::SeqCst);
                        let next = current
                            .saturating_mul(2)
                            .min(millis(inner.config.restart_max_delay));
                        inner.restart_delay_ms.store(next, Ordering::SeqCst);
                        tracing::warn!(attempt, error = %e, next_delay_ms = next, "Worker restart failed");
                    }
                }
            }
        });
    }

    async fn call_tool(self: &Arc<Self>, name: &str, arguments: Value) -> Result<Value, RpcError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RpcError::ShuttingDown);
        }
        let handle = match self.current_worker() {
            Some(h) => h,
            None => {
                self.start().await?;
                self.current_worker().ok_or_else(|| RpcError::ProcessExited {
                    tool: name.to_string(),
                    reason: "worker exited during startup".to_string(),
                })?
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let line = RpcRequest::tool_call(id, name, arguments).to_line()?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingCall {
                tool: name.to_string(),
                generation: handle.generation,
                tx,
            },
        );
        // 调用方丢弃 future 时同样移除待决项
        let _guard = PendingGuard { inner: self, id };

        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RpcError::ShuttingDown);
        }
        if !handle.is_alive() {
            return Err(RpcError::ProcessExited {
                tool: name.to_string(),
                reason: "worker exited before the request was sent".to_string(),
            });
        }

        tracing::debug!(tool = name, id, generation = handle.generation, "Sending tool call");
        let writing = AtomicBool::new(false);
        let exchange = async {
            if let Err(e) = handle.write_line(&line, &writing).await {
                // 若退出处理已拒绝该调用，以其结果为准
                if self.take_pending(id).is_some() {
                    return Err(RpcError::ProcessExited {
                        tool: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(RpcError::ProcessExited {
                    tool: name.to_string(),
                    reason: "pending call dropped".to_string(),
                }),
            }
        };

        match timeout(self.config.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.take_pending(id);
                let timeout_ms = millis(self.config.call_timeout);
                if writing.load(Ordering::SeqCst) {
                    // 半行已写入 stdin，后续请求的分帧无法恢复
                    tracing::warn!(
                        tool = name,
                        id,
                        generation = handle.generation,
                        "Worker stopped reading stdin mid-request, killing"
                    );
                    handle.kill();
                }
                tracing::warn!(tool = name, id, timeout_ms, "Tool call timed out");
                Err(RpcError::Timeout {
                    tool: name.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Rejecting pending calls for shutdown");
        }
        for call in drained {
            let _ = call.tx.send(Err(RpcError::ShuttingDown));
        }

        let Some(handle) = lock(&self.worker).take() else {
            tracing::info!("Worker client shut down (no running worker)");
            return;
        };
        tracing::info!(generation = handle.generation, pid = ?handle.pid, "Stopping worker");

        handle.stdin.lock().await.take();
        #[cfg(unix)]
        {
            if let Some(pid) = handle.pid {
                terminate(pid);
            }
        }

        let mut exit_rx = handle.exit_rx.clone();
        let exited = timeout(self.config.shutdown_grace, exit_rx.wait_for(|e| *e))
            .await
            .is_ok();
        if !exited {
            tracing::warn!(
                generation = handle.generation,
                grace_ms = millis(self.config.shutdown_grace),
                "Worker did not exit within grace period, killing"
            );
            handle.kill();
            let _ = timeout(KILL_WAIT, exit_rx.wait_for(|e| *e)).await;
        }
        tracing::info!(generation = handle.generation, "Worker stopped");
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM delivery failed");
    }
}

async fn read_stdout(inner: Weak<ClientInner>, generation: u64, mut stdout: ChildStdout) {
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let Some(inner) = inner.upgrade() else { break };
                for line in lines.push(&chunk[..n]) {
                    inner.dispatch_line(generation, &line);
                }
            }
            Err(e) => {
                tracing::warn!(generation, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    if lines.pending_len() > 0 {
        tracing::debug!(generation, bytes = lines.pending_len(), "Dropping unterminated worker output");
    }
}

/// 按字节读行并有损解码；Worker 存活期间读端保持打开
async fn log_stderr(generation: u64, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!(target: "phaseflow::worker", generation, "{}", line.trim_end());
            }
            Err(e) => {
                tracing::debug!(generation, error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}

async fn supervise(
    inner: Weak<ClientInner>,
    generation: u64,
    mut child: Child,
    exited: Arc<AtomicBool>,
    kill_rx: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    exit_tx: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let reason = match &status {
        Ok(s) => s.to_string(),
        Err(e) => e.to_string(),
    };
    exited.store(true, Ordering::SeqCst);

    // 先让读任务把进程退出前写出的响应交付完
    let _ = timeout(READER_DRAIN_TIMEOUT, reader).await;
    let _ = exit_tx.send(true);

    if let Some(inner) = inner.upgrade() {
        inner.on_worker_exit(generation, reason);
    }
}
