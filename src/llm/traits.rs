//! 推理后端抽象
//!
//! ModelBackend：已加载模型的统一生成能力；BackendFactory：按 model_id 估算占用、加载与卸载。
//! 错误以 String 返回，由上层包装为 ModelLoadError / GenerationError。

use std::sync::Arc;

use async_trait::async_trait;

/// 已加载的模型实例
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn model_id(&self) -> &str;

    /// 文本补全：prompt -> 生成文本
    async fn generate(&self, prompt: &str, max_new_tokens: u32) -> Result<String, String>;
}

/// 后端工厂：由 ModelLifecycleManager 注入，测试中替换为 mock
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// 估算加载该模型所需的显存/内存字节数
    fn estimate_footprint(&self, model_id: &str) -> u64;

    /// 加载模型（可能很慢）
    async fn load(&self, model_id: &str) -> Result<Arc<dyn ModelBackend>, String>;

    /// 释放模型占用的资源；默认直接丢弃
    async fn unload(&self, backend: Arc<dyn ModelBackend>) {
        drop(backend);
    }
}
