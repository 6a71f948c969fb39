//! Mock 后端（测试与本地演示，无需模型）
//!
//! ScriptedBackend 依次返回预设回复，脚本用完后重复最后一条；没有脚本时回显 Prompt 中最后一个 User 问题。
//! MockBackendFactory 记录加载 / 卸载次数，可配置加载延迟、占用大小、必定失败的 model_id。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::traits::{BackendFactory, ModelBackend};

/// 默认占用（字节）
const DEFAULT_MOCK_FOOTPRINT: u64 = 1;

/// 一条脚本回复：文本或生成错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptItem {
    Text(String),
    Fail(String),
    /// 永不返回（用于超时测试）
    Hang,
}

impl From<&str> for ScriptItem {
    fn from(s: &str) -> Self {
        ScriptItem::Text(s.to_string())
    }
}

/// 按脚本回复的后端
pub struct ScriptedBackend {
    model_id: String,
    script: Mutex<VecDeque<ScriptItem>>,
    last: Mutex<Option<ScriptItem>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new(model_id: impl Into<String>, script: Vec<ScriptItem>) -> Self {
        Self {
            model_id: model_id.into(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_prompt_log(mut self, prompts: Arc<Mutex<Vec<String>>>) -> Self {
        self.prompts = prompts;
        self
    }

    fn next_item(&self) -> Option<ScriptItem> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match script.pop_front() {
            Some(item) => {
                *last = Some(item.clone());
                Some(item)
            }
            None => last.clone(),
        }
    }
}

/// Prompt 中最后一个 `User: ` 行
fn last_user_line(prompt: &str) -> &str {
    prompt
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix("User: "))
        .unwrap_or("(no input)")
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, prompt: &str, _max_new_tokens: u32) -> Result<String, String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        match self.next_item() {
            Some(ScriptItem::Text(t)) => Ok(t),
            Some(ScriptItem::Fail(e)) => Err(e),
            Some(ScriptItem::Hang) => {
                futures_util::future::pending::<()>().await;
                Err("unreachable".to_string())
            }
            None => Ok(format!(
                "Thought: No tools needed.\nFinal Answer: Echo from mock: {}",
                last_user_line(prompt)
            )),
        }
    }
}

/// Mock 工厂
#[derive(Default)]
pub struct MockBackendFactory {
    scripts: HashMap<String, Vec<ScriptItem>>,
    default_script: Vec<ScriptItem>,
    footprints: HashMap<String, u64>,
    default_footprint: Option<u64>,
    failing: HashSet<String>,
    load_delay: Duration,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有模型共用的脚本
    pub fn with_script<I: Into<ScriptItem>>(mut self, items: impl IntoIterator<Item = I>) -> Self {
        self.default_script = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_script<I: Into<ScriptItem>>(
        mut self,
        model_id: &str,
        items: impl IntoIterator<Item = I>,
    ) -> Self {
        self.scripts
            .insert(model_id.to_string(), items.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_footprint(mut self, model_id: &str, bytes: u64) -> Self {
        self.footprints.insert(model_id.to_string(), bytes);
        self
    }

    pub fn with_default_footprint(mut self, bytes: u64) -> Self {
        self.default_footprint = Some(bytes);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// 该 model_id 的加载必定失败
    pub fn failing(mut self, model_id: &str) -> Self {
        self.failing.insert(model_id.to_string());
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// 所有后端收到过的 Prompt（按时间顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BackendFactory for MockBackendFactory {
    fn estimate_footprint(&self, model_id: &str) -> u64 {
        self.footprints
            .get(model_id)
            .copied()
            .or(self.default_footprint)
            .unwrap_or(DEFAULT_MOCK_FOOTPRINT)
    }

    async fn load(&self, model_id: &str) -> Result<Arc<dyn ModelBackend>, String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.failing.contains(model_id) {
            return Err(format!("mock load failure for {}", model_id));
        }
        let script = self
            .scripts
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        Ok(Arc::new(
            ScriptedBackend::new(model_id, script).with_prompt_log(self.prompts.clone()),
        ))
    }

    async fn unload(&self, backend: Arc<dyn ModelBackend>) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(model_id = %backend.model_id(), "mock backend unloaded");
    }
}
