//! 核心层：错误分类、运行监管（取消令牌表）、优雅关闭

pub mod error;
pub mod run_supervisor;
pub mod shutdown;

pub use error::{AgentError, GenerationError, ModelLoadError, ToolError};
pub use run_supervisor::{RunGuard, RunSupervisor};
pub use shutdown::{
    CancelRunsCleanup, CleanupOutcome, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, UnloadModelsCleanup,
};
