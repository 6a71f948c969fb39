//! 模型层：后端抽象、生命周期管理、Mock 与 OpenAI 兼容实现

pub mod manager;
pub mod mock;
pub mod openai;
pub mod traits;

pub use manager::{
    BackendLease, ManagerConfig, MemoryUsage, ModelInfo, ModelLifecycleManager, ModelState,
};
pub use mock::{MockBackendFactory, ScriptItem, ScriptedBackend};
pub use openai::{OpenAiBackend, OpenAiBackendFactory};
pub use traits::{BackendFactory, ModelBackend};
