//! Tool Agent - ReAct 工具调用智能体服务
//!
//! 模块划分：
//! - **agent**: 组件装配（工具注册表、模型管理器、ReAct 主循环、运行监管）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、运行取消表、优雅关闭
//! - **gateway**: HTTP 网关（API Key 认证、JSON / NDJSON 响应）
//! - **llm**: 后端抽象、模型生命周期管理（单飞加载、LRU 淘汰）、Mock 与 OpenAI 兼容实现
//! - **observability**: tracing 订阅器
//! - **react**: 步骤与运行记录、Prompt 构建、输出解析、主循环
//! - **tools**: 工具注册表、参数校验与内置工具

pub mod agent;
pub mod config;
pub mod core;
#[cfg(feature = "server")]
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::AgentComponents;
pub use react::{AgentLoop, AgentRun, RunRequest, RunStatus};
