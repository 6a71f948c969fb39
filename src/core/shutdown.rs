//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后网关停止接收新请求，再按注册顺序执行清理任务：
//! 先取消活跃 run（run 在下一个步骤边界结束并归还模型租约），再卸载已就绪的模型。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::RunSupervisor;
use crate::llm::ModelLifecycleManager;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    Requested(String),
}

/// 进程级关闭信号：只记录第一次触发的原因
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；返回 false 表示此前已触发
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        tracing::info!(reason = ?reason, "graceful shutdown initiated");
        *slot = Some(reason);
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与（Unix 下）SIGTERM
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                r = tokio::signal::ctrl_c() => match r {
                    Ok(()) => ShutdownReason::Interrupt,
                    Err(e) => {
                        tracing::warn!("failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                },
                _ = terminate() => ShutdownReason::Terminate,
                _ = manager.wait() => return,
            };
            manager.trigger(reason);
        });
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("failed to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// 关闭时的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cleanup(&self) -> Result<(), String>;
}

/// 单个清理任务的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Done,
    Failed(String),
    TimedOut,
}

/// 按注册顺序执行清理任务，每个任务单独限时
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    pub fn register(&mut self, task: impl ShutdownCleanup + 'static) {
        self.tasks.push(Box::new(task));
    }

    pub async fn run_cleanup(&self) -> Vec<(&'static str, CleanupOutcome)> {
        let mut report = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let outcome = match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => CleanupOutcome::Done,
                Ok(Err(e)) => CleanupOutcome::Failed(e),
                Err(_) => CleanupOutcome::TimedOut,
            };
            match &outcome {
                CleanupOutcome::Done => tracing::info!(task = task.name(), "cleanup done"),
                CleanupOutcome::Failed(e) => {
                    tracing::warn!(task = task.name(), error = %e, "cleanup failed")
                }
                CleanupOutcome::TimedOut => tracing::warn!(
                    task = task.name(),
                    timeout_secs = self.per_task_timeout.as_secs(),
                    "cleanup timed out"
                ),
            }
            report.push((task.name(), outcome));
        }
        report
    }
}

/// 取消全部活跃 run
pub struct CancelRunsCleanup {
    runs: RunSupervisor,
}

impl CancelRunsCleanup {
    pub fn new(runs: RunSupervisor) -> Self {
        Self { runs }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for CancelRunsCleanup {
    fn name(&self) -> &'static str {
        "cancel_runs"
    }

    async fn cleanup(&self) -> Result<(), String> {
        let n = self.runs.cancel_all();
        tracing::info!(active_runs = n, "cancelled active runs");
        Ok(())
    }
}

/// 卸载全部已就绪模型
pub struct UnloadModelsCleanup {
    manager: Arc<ModelLifecycleManager>,
}

impl UnloadModelsCleanup {
    pub fn new(manager: Arc<ModelLifecycleManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for UnloadModelsCleanup {
    fn name(&self) -> &'static str {
        "unload_models"
    }

    async fn cleanup(&self) -> Result<(), String> {
        let n = self.manager.unload_all().await;
        tracing::info!(models = n, "unloaded resident models");
        Ok(())
    }
}
