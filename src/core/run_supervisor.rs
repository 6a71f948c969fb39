//! 运行监管：活跃 run 的取消令牌表
//!
//! 每个 run 注册后得到 RunGuard（持有子 token），guard drop 时自动从表中移除。
//! 所有子 token 派生自同一根 token，关停时 cancel_all 一次取消全部 run。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

type RunTable = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock(runs: &RunTable) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    runs.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct RunSupervisor {
    root: CancellationToken,
    runs: RunTable,
}

/// 活跃 run 的登记凭证
#[derive(Debug)]
pub struct RunGuard {
    run_id: String,
    token: CancellationToken,
    runs: RunTable,
}

impl RunGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.runs).remove(&self.run_id);
    }
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新 run；关停后登记的 run 拿到的 token 已处于取消状态
    pub fn register(&self, run_id: impl Into<String>) -> RunGuard {
        let run_id = run_id.into();
        let token = self.root.child_token();
        lock(&self.runs).insert(run_id.clone(), token.clone());
        RunGuard {
            run_id,
            token,
            runs: self.runs.clone(),
        }
    }

    /// 取消指定 run；不存在（或已结束）返回 false
    pub fn cancel(&self, run_id: &str) -> bool {
        match lock(&self.runs).get(run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部 run（含之后登记的）
    pub fn cancel_all(&self) -> usize {
        let n = lock(&self.runs).len();
        self.root.cancel();
        n
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.runs).keys().cloned().collect();
        ids.sort();
        ids
    }
}
