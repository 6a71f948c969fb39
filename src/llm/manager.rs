//! 模型生命周期管理
//!
//! model_id -> 槽位（Loading / Ready / Failed）。互斥锁只覆盖决策阶段（命中 / 合并 / 淘汰 / 准入），
//! 加载本身在独立任务中进行，结果经 watch 通道广播给所有合并等待者（single-flight）。
//!
//! - 准入：Ready + Loading 占用之和加上新模型估算值不超过预算；不够时按 last_used 升序
//!   （相同则占用大者优先）淘汰空闲的 Ready 槽位，正在服务请求（in_use > 0）的槽位永不淘汰。
//! - 失败：槽位置为 Failed 不自动重试，等待者拿到同一个 ModelLoadError；Failed 不占预算，
//!   下一次新请求会清除它并重新加载。
//! - 租约：resolve 返回 BackendLease，持有期间 in_use 计数 +1，drop 时归还并刷新 last_used。
//!   合并等待者记在 Loading 槽位的 waiters 上，加载任务置 Ready 时在同一把锁内转为 in_use，
//!   因此刚加载完、等待者尚未被唤醒的模型也不会被淘汰。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::{AgentError, ModelLoadError};
use crate::llm::traits::{BackendFactory, ModelBackend};

type LoadOutcome = Option<Result<Arc<dyn ModelBackend>, ModelLoadError>>;

/// 管理器配置
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// 可用显存/内存预算（字节）
    pub memory_budget_bytes: u64,
}

enum SlotState {
    Loading(watch::Receiver<LoadOutcome>),
    Ready(Arc<dyn ModelBackend>),
    Failed(ModelLoadError),
}

struct Slot {
    state: SlotState,
    footprint: u64,
    last_used: Instant,
    in_use: usize,
    /// 等待本次加载的调用方数量（仅 Loading 状态有意义）
    waiters: usize,
    /// 区分同名槽位的先后实例，旧租约归还时不误改新槽位
    generation: u64,
}

impl Slot {
    fn occupies_memory(&self) -> bool {
        !matches!(self.state, SlotState::Failed(_))
    }
}

#[derive(Default)]
struct Slots {
    map: HashMap<String, Slot>,
    next_generation: u64,
}

type Shared = Arc<Mutex<Slots>>;

fn lock(shared: &Shared) -> MutexGuard<'_, Slots> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 槽位状态（对外快照）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Loading,
    Ready,
    Failed,
}

/// 单个模型的快照
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub state: ModelState,
    pub in_use: usize,
    pub footprint_bytes: u64,
    pub idle_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 预算使用情况
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub budget_bytes: u64,
}

/// 后端租约：持有期间该模型不会被淘汰
pub struct BackendLease {
    shared: Shared,
    model_id: String,
    generation: u64,
    backend: Arc<dyn ModelBackend>,
}

impl BackendLease {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease")
            .field("model_id", &self.model_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        let mut slots = lock(&self.shared);
        if let Some(slot) = slots.map.get_mut(&self.model_id) {
            if slot.generation == self.generation {
                slot.in_use = slot.in_use.saturating_sub(1);
                slot.last_used = Instant::now();
            }
        }
    }
}

/// 等待中的租约：加载成功时 in_use 已由加载任务计入，转为 BackendLease；
/// 中途被丢弃则撤销自己的计数
struct PendingLease {
    shared: Shared,
    model_id: String,
    generation: u64,
    rx: watch::Receiver<LoadOutcome>,
    armed: bool,
}

impl PendingLease {
    async fn outcome(&mut self) -> LoadOutcome {
        let waited = self.rx.wait_for(Option::is_some).await;
        waited.ok().and_then(|v| (*v).clone())
    }

    fn into_lease(mut self, backend: Arc<dyn ModelBackend>) -> BackendLease {
        self.armed = false;
        BackendLease {
            shared: self.shared.clone(),
            model_id: self.model_id.clone(),
            generation: self.generation,
            backend,
        }
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = lock(&self.shared);
        if let Some(slot) = slots.map.get_mut(&self.model_id) {
            if slot.generation != self.generation {
                return;
            }
            match slot.state {
                SlotState::Loading(_) => slot.waiters = slot.waiters.saturating_sub(1),
                SlotState::Ready(_) => {
                    slot.in_use = slot.in_use.saturating_sub(1);
                    slot.last_used = Instant::now();
                }
                SlotState::Failed(_) => {}
            }
        }
    }
}

enum Decision {
    Leased(BackendLease),
    Wait(PendingLease),
}

pub struct ModelLifecycleManager {
    shared: Shared,
    factory: Arc<dyn BackendFactory>,
    config: ManagerConfig,
}

impl ModelLifecycleManager {
    pub fn new(factory: Arc<dyn BackendFactory>, config: ManagerConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Slots::default())),
            factory,
            config,
        }
    }

    /// 取得可用后端；未加载时加载（并发请求合并为一次加载），必要时淘汰空闲模型
    pub async fn resolve(&self, model_id: &str) -> Result<BackendLease, ModelLoadError> {
        let mut pending = match self.decide(model_id)? {
            Decision::Leased(lease) => return Ok(lease),
            Decision::Wait(pending) => pending,
        };

        match pending.outcome().await {
            Some(Ok(backend)) => Ok(pending.into_lease(backend)),
            Some(Err(e)) => Err(e),
            None => {
                let err = ModelLoadError::new(model_id, "load task ended without a result");
                self.mark_failed(model_id, pending.generation, err.clone());
                Err(err)
            }
        }
    }

    fn pending(
        &self,
        model_id: &str,
        generation: u64,
        rx: watch::Receiver<LoadOutcome>,
    ) -> PendingLease {
        PendingLease {
            shared: self.shared.clone(),
            model_id: model_id.to_string(),
            generation,
            rx,
            armed: true,
        }
    }

    /// 归还租约（等价于 drop）
    pub fn release(&self, lease: BackendLease) {
        drop(lease);
    }

    fn decide(&self, model_id: &str) -> Result<Decision, ModelLoadError> {
        let mut slots = lock(&self.shared);

        if let Some(slot) = slots.map.get_mut(model_id) {
            match &slot.state {
                SlotState::Ready(backend) => {
                    slot.in_use += 1;
                    slot.last_used = Instant::now();
                    return Ok(Decision::Leased(BackendLease {
                        shared: self.shared.clone(),
                        model_id: model_id.to_string(),
                        generation: slot.generation,
                        backend: backend.clone(),
                    }));
                }
                SlotState::Loading(rx) => {
                    tracing::debug!(model_id = %model_id, "joining in-flight load");
                    let rx = rx.clone();
                    slot.waiters += 1;
                    let generation = slot.generation;
                    return Ok(Decision::Wait(self.pending(model_id, generation, rx)));
                }
                SlotState::Failed(_) => {}
            }
        }

        // 准入：先清掉 Failed 槽位（含本模型上一次的失败记录）
        slots.map.retain(|_, s| s.occupies_memory());
        let footprint = self.factory.estimate_footprint(model_id);
        let budget = self.config.memory_budget_bytes;
        if footprint > budget {
            return Err(ModelLoadError::new(
                model_id,
                format!(
                    "estimated footprint {} bytes exceeds memory budget {} bytes",
                    footprint, budget
                ),
            ));
        }

        let mut used: u64 = slots.map.values().map(|s| s.footprint).sum();
        let mut evicted = Vec::new();
        while used + footprint > budget {
            let victim = slots
                .map
                .iter()
                .filter(|(_, s)| s.in_use == 0 && matches!(s.state, SlotState::Ready(_)))
                .min_by(|(a_id, a), (b_id, b)| {
                    a.last_used
                        .cmp(&b.last_used)
                        .then(b.footprint.cmp(&a.footprint))
                        .then_with(|| a_id.cmp(b_id))
                })
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                return Err(ModelLoadError::new(
                    model_id,
                    format!(
                        "insufficient memory: need {} bytes, {} of {} bytes held by busy or loading models",
                        footprint, used, budget
                    ),
                ));
            };
            if let Some(slot) = slots.map.remove(&victim) {
                used -= slot.footprint;
                tracing::info!(model_id = %victim, footprint = slot.footprint, "evicting idle model");
                if let SlotState::Ready(backend) = slot.state {
                    evicted.push(backend);
                }
            }
        }

        let (tx, rx) = watch::channel(None);
        let generation = slots.next_generation;
        slots.next_generation += 1;
        slots.map.insert(
            model_id.to_string(),
            Slot {
                state: SlotState::Loading(rx.clone()),
                footprint,
                last_used: Instant::now(),
                in_use: 0,
                waiters: 1,
                generation,
            },
        );
        drop(slots);

        tracing::info!(model_id = %model_id, footprint, "loading model");
        let shared = self.shared.clone();
        let factory = self.factory.clone();
        let id = model_id.to_string();
        // 加载在独立任务中进行：发起者被取消不会中断其他等待者共享的加载
        tokio::spawn(async move {
            for backend in evicted {
                factory.unload(backend).await;
            }
            let started = Instant::now();
            let result = factory
                .load(&id)
                .await
                .map_err(|cause| ModelLoadError::new(id.as_str(), cause));

            let outcome = {
                let mut slots = lock(&shared);
                match slots.map.get_mut(&id) {
                    Some(slot) if slot.generation == generation => {
                        match &result {
                            Ok(backend) => {
                                tracing::info!(
                                    model_id = %id,
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    "model ready"
                                );
                                slot.state = SlotState::Ready(backend.clone());
                                slot.in_use += std::mem::take(&mut slot.waiters);
                                slot.last_used = Instant::now();
                            }
                            Err(e) => {
                                tracing::warn!(model_id = %id, error = %e, "model load failed");
                                slot.state = SlotState::Failed(e.clone());
                                slot.waiters = 0;
                            }
                        }
                        Ok(result)
                    }
                    _ => Err(result),
                }
            };

            let published = match outcome {
                Ok(result) => result,
                Err(orphaned) => {
                    if let Ok(backend) = orphaned {
                        factory.unload(backend).await;
                    }
                    Err(ModelLoadError::new(id.as_str(), "model was unloaded while loading"))
                }
            };
            let _ = tx.send(Some(published));
        });

        Ok(Decision::Wait(self.pending(model_id, generation, rx)))
    }

    fn mark_failed(&self, model_id: &str, generation: u64, err: ModelLoadError) {
        let mut slots = lock(&self.shared);
        if let Some(slot) = slots.map.get_mut(model_id) {
            if slot.generation == generation && matches!(slot.state, SlotState::Loading(_)) {
                slot.state = SlotState::Failed(err);
                slot.waiters = 0;
            }
        }
    }

    /// 显式卸载：加载中或使用中返回 ModelBusy，不存在返回 ModelNotLoaded
    pub async fn unload(&self, model_id: &str) -> Result<(), AgentError> {
        let backend = {
            let mut slots = lock(&self.shared);
            let Some(slot) = slots.map.get(model_id) else {
                return Err(AgentError::ModelNotLoaded(model_id.to_string()));
            };
            match &slot.state {
                SlotState::Loading(_) => {
                    return Err(AgentError::ModelBusy(format!("{} is loading", model_id)))
                }
                SlotState::Ready(_) if slot.in_use > 0 => {
                    return Err(AgentError::ModelBusy(format!(
                        "{} is serving {} request(s)",
                        model_id, slot.in_use
                    )))
                }
                _ => {}
            }
            match slots.map.remove(model_id).map(|s| s.state) {
                Some(SlotState::Ready(backend)) => Some(backend),
                _ => None,
            }
        };
        if let Some(backend) = backend {
            tracing::info!(model_id = %model_id, "unloading model");
            self.factory.unload(backend).await;
        }
        Ok(())
    }

    /// 关停时卸载全部已就绪模型；未归还的租约在 drop 时找不到槽位，不受影响
    pub async fn unload_all(&self) -> usize {
        let backends: Vec<Arc<dyn ModelBackend>> = {
            let mut slots = lock(&self.shared);
            let ids: Vec<String> = slots
                .map
                .iter()
                .filter(|(_, s)| !matches!(s.state, SlotState::Loading(_)))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| slots.map.remove(id))
                .filter_map(|s| match s.state {
                    SlotState::Ready(b) => Some(b),
                    _ => None,
                })
                .collect()
        };
        let count = backends.len();
        for backend in backends {
            tracing::info!(model_id = %backend.model_id(), "unloading model");
            self.factory.unload(backend).await;
        }
        count
    }

    /// 模型注册表快照，按 model_id 排序
    pub fn list_models(&self) -> Vec<ModelInfo> {
        let slots = lock(&self.shared);
        let now = Instant::now();
        let mut out: Vec<ModelInfo> = slots
            .map
            .iter()
            .map(|(id, s)| {
                let (state, error) = match &s.state {
                    SlotState::Loading(_) => (ModelState::Loading, None),
                    SlotState::Ready(_) => (ModelState::Ready, None),
                    SlotState::Failed(e) => (ModelState::Failed, Some(e.cause.clone())),
                };
                ModelInfo {
                    model_id: id.clone(),
                    state,
                    in_use: s.in_use,
                    footprint_bytes: s.footprint,
                    idle_secs: now.saturating_duration_since(s.last_used).as_secs(),
                    error,
                }
            })
            .collect();
        out.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        out
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let slots = lock(&self.shared);
        MemoryUsage {
            used_bytes: slots
                .map
                .values()
                .filter(|s| s.occupies_memory())
                .map(|s| s.footprint)
                .sum(),
            budget_bytes: self.config.memory_budget_bytes,
        }
    }

    pub fn state_of(&self, model_id: &str) -> Option<ModelState> {
        self.list_models()
            .into_iter()
            .find(|m| m.model_id == model_id)
            .map(|m| m.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockBackendFactory;
    use futures_util::FutureExt;
    use std::time::Duration;

    async fn wait_ready(mgr: &ModelLifecycleManager, model_id: &str) {
        while mgr.state_of(model_id) != Some(ModelState::Ready) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn manager(factory: Arc<MockBackendFactory>, budget: u64) -> ModelLifecycleManager {
        ModelLifecycleManager::new(
            factory,
            ManagerConfig {
                memory_budget_bytes: budget,
            },
        )
    }

    #[tokio::test]
    async fn test_concurrent_resolves_coalesce_into_one_load() {
        let factory = Arc::new(
            MockBackendFactory::new().with_load_delay(Duration::from_millis(50)),
        );
        let mgr = manager(factory.clone(), 100);
        let (a, b) = tokio::join!(mgr.resolve("m"), mgr.resolve("m"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(factory.load_count(), 1);
        assert_eq!(a.model_id(), "m");
        assert_eq!(mgr.list_models()[0].in_use, 2);
        drop(a);
        mgr.release(b);
        assert_eq!(mgr.list_models()[0].in_use, 0);
    }

    #[tokio::test]
    async fn test_ready_model_reused_without_reload() {
        let factory = Arc::new(MockBackendFactory::new());
        let mgr = manager(factory.clone(), 100);
        drop(mgr.resolve("m").await.unwrap());
        drop(mgr.resolve("m").await.unwrap());
        assert_eq!(factory.load_count(), 1);
        assert_eq!(mgr.state_of("m"), Some(ModelState::Ready));
    }

    #[tokio::test]
    async fn test_load_failure_shared_and_not_retried() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .failing("broken")
                .with_load_delay(Duration::from_millis(20)),
        );
        let mgr = manager(factory.clone(), 100);
        let (a, b) = tokio::join!(mgr.resolve("broken"), mgr.resolve("broken"));
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert_eq!(a, b);
        assert_eq!(a.model_id, "broken");
        assert_eq!(factory.load_count(), 1);
        assert_eq!(mgr.state_of("broken"), Some(ModelState::Failed));
        // Failed 不占预算
        assert_eq!(mgr.memory_usage().used_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_skips_in_use() {
        let factory = Arc::new(MockBackendFactory::new().with_default_footprint(40));
        let mgr = manager(factory.clone(), 100);

        let a = mgr.resolve("a").await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(mgr.resolve("b").await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        // a 仍在使用中：即使 a 更久未用，也只能淘汰 b
        drop(mgr.resolve("c").await.unwrap());

        let ids: Vec<String> = mgr.list_models().into_iter().map(|m| m.model_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(factory.unload_count(), 1);

        drop(a);
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(mgr.resolve("c").await.unwrap());
        // 现在 a 最久未用
        drop(mgr.resolve("d").await.unwrap());
        let ids: Vec<String> = mgr.list_models().into_iter().map(|m| m.model_id).collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_tie_breaks_on_largest_footprint() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_footprint("small", 20)
                .with_footprint("big", 50)
                .with_footprint("new", 40),
        );
        let mgr = manager(factory.clone(), 100);
        let (s, b) = tokio::join!(mgr.resolve("small"), mgr.resolve("big"));
        // 同一时刻归还：last_used 相同
        drop(s.unwrap());
        drop(b.unwrap());
        drop(mgr.resolve("new").await.unwrap());
        let ids: Vec<String> = mgr.list_models().into_iter().map(|m| m.model_id).collect();
        assert_eq!(ids, vec!["new", "small"]);
    }

    #[tokio::test]
    async fn test_all_busy_fails_fast() {
        let factory = Arc::new(MockBackendFactory::new().with_default_footprint(60));
        let mgr = manager(factory.clone(), 100);
        let _held = mgr.resolve("a").await.unwrap();
        let err = mgr.resolve("b").await.unwrap_err();
        assert!(err.cause.contains("insufficient memory"));
        assert_eq!(factory.load_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_load_is_held_for_unclaimed_waiter() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_default_footprint(60)
                .with_load_delay(Duration::from_millis(20)),
        );
        let mgr = manager(factory.clone(), 100);

        // 发起加载后不再轮询：加载完成时等待者尚未领取租约
        let mut a = Box::pin(mgr.resolve("a"));
        assert!((&mut a).now_or_never().is_none());
        wait_ready(&mgr, "a").await;
        assert_eq!(mgr.list_models()[0].in_use, 1);

        let err = mgr.resolve("b").await.unwrap_err();
        assert!(err.cause.contains("insufficient memory"));

        let lease = a.await.unwrap();
        assert_eq!(lease.model_id(), "a");
        assert_eq!(factory.load_count(), 1);
        assert_eq!(factory.unload_count(), 0);
        drop(lease);
        assert_eq!(mgr.list_models()[0].in_use, 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_pin_model() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_default_footprint(60)
                .with_load_delay(Duration::from_millis(20)),
        );
        let mgr = manager(factory.clone(), 100);

        let mut a = Box::pin(mgr.resolve("a"));
        assert!((&mut a).now_or_never().is_none());
        drop(a);
        wait_ready(&mgr, "a").await;
        assert_eq!(mgr.list_models()[0].in_use, 0);

        drop(mgr.resolve("b").await.unwrap());
        assert_eq!(mgr.state_of("a"), None);
        assert_eq!(factory.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_model_rejected() {
        let factory = Arc::new(MockBackendFactory::new().with_footprint("huge", 500));
        let mgr = manager(factory.clone(), 100);
        let err = mgr.resolve("huge").await.unwrap_err();
        assert!(err.cause.contains("exceeds memory budget"));
        assert_eq!(factory.load_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_unload() {
        let factory = Arc::new(MockBackendFactory::new());
        let mgr = manager(factory.clone(), 100);
        assert!(matches!(mgr.unload("m").await, Err(AgentError::ModelNotLoaded(_))));
        let lease = mgr.resolve("m").await.unwrap();
        assert!(matches!(mgr.unload("m").await, Err(AgentError::ModelBusy(_))));
        drop(lease);
        mgr.unload("m").await.unwrap();
        assert!(mgr.list_models().is_empty());
        assert_eq!(factory.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_model_reloaded_on_new_request() {
        let factory = Arc::new(MockBackendFactory::new().failing("m"));
        let mgr = manager(factory.clone(), 100);
        assert!(mgr.resolve("m").await.is_err());
        assert!(mgr.resolve("m").await.is_err());
        assert_eq!(factory.load_count(), 2);
    }
}
