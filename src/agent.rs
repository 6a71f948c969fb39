//! Agent 组件装配
//!
//! 从 AppConfig 构建网关与测试共享的组件：工具注册表、模型生命周期管理器、ReAct 主循环、
//! 运行监管。组件在启动时一次性构建，之后只读共享。

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AgentSection, AppConfig, ModelsSection, ToolsSection};
use crate::core::{AgentError, RunSupervisor};
use crate::llm::{
    BackendFactory, ManagerConfig, MockBackendFactory, ModelLifecycleManager, OpenAiBackendFactory,
};
use crate::react::{AgentLoop, LoopConfig};
use crate::tools::{
    CalculatorTool, ListDirectoryTool, ReadFileTool, RunCommandTool, SystemInfoTool, Tool,
    ToolRegistry, WebPageReaderTool, WriteFileTool,
};

/// 预构建的 Agent 组件，可被多个并发 run 共享
pub struct AgentComponents {
    pub registry: Arc<ToolRegistry>,
    pub manager: Arc<ModelLifecycleManager>,
    pub agent_loop: Arc<AgentLoop>,
    pub runs: RunSupervisor,
    pub config: AppConfig,
}

impl AgentComponents {
    /// 按配置构建全部组件；重复或非法的工具描述符在这里失败
    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let registry = Arc::new(build_registry(&config.tools)?);
        let factory = build_factory(&config.models)?;
        Ok(Self::with_factory(config, registry, factory))
    }

    /// 使用给定注册表与后端工厂构建（测试中注入 MockBackendFactory）
    pub fn with_factory(
        config: AppConfig,
        registry: Arc<ToolRegistry>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        let manager = Arc::new(ModelLifecycleManager::new(
            factory,
            ManagerConfig {
                memory_budget_bytes: config.models.memory_budget_bytes,
            },
        ));
        let agent_loop = Arc::new(AgentLoop::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            loop_config(&config.agent),
        ));
        Self {
            registry,
            manager,
            agent_loop,
            runs: RunSupervisor::new(),
            config,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.config.agent.default_model
    }
}

/// [agent] 段 -> 循环预算
pub fn loop_config(agent: &AgentSection) -> LoopConfig {
    LoopConfig {
        max_iterations: agent.max_iterations,
        max_wall_time: Duration::from_secs(agent.max_wall_time_secs),
        generation_timeout: Duration::from_secs(agent.generation_timeout_secs),
        max_new_tokens: agent.max_new_tokens,
    }
}

/// 注册内置工具（calculator、read_file、write_file、list_directory、run_command、
/// system_info、read_webpage）；`enabled` 非空时只注册其中列出的工具
pub fn build_registry(tools: &ToolsSection) -> Result<ToolRegistry, AgentError> {
    if let Err(e) = std::fs::create_dir_all(&tools.workspace_root) {
        tracing::warn!(
            root = %tools.workspace_root.display(),
            "failed to create workspace root: {}",
            e
        );
    }
    let root = &tools.workspace_root;

    let builtins: Vec<Arc<dyn Tool>> = vec![
        Arc::new(CalculatorTool),
        Arc::new(ReadFileTool::new(root)),
        Arc::new(WriteFileTool::new(root)),
        Arc::new(ListDirectoryTool::new(root)),
        Arc::new(RunCommandTool::new(
            tools.shell.allowed_commands.clone(),
            tools.shell.default_timeout_secs,
        )),
        Arc::new(SystemInfoTool),
        Arc::new(WebPageReaderTool::new(
            tools.web.allowed_domains.clone(),
            tools.web.timeout_secs,
            tools.web.max_result_chars,
        )),
    ];

    let known: Vec<&str> = builtins.iter().map(|t| t.name()).collect();
    for name in &tools.enabled {
        if !known.contains(&name.as_str()) {
            return Err(AgentError::ConfigError(format!(
                "tools.enabled names unknown tool '{}' (built-in tools: {})",
                name,
                known.join(", ")
            )));
        }
    }

    let mut registry = ToolRegistry::new().with_timeout(tools.tool_timeout_secs);
    for tool in builtins {
        if tools.enabled.is_empty() || tools.enabled.iter().any(|n| n == tool.name()) {
            registry.register_arc(tool)?;
        }
    }
    Ok(registry)
}

/// 按 models.backend 选择后端工厂
pub fn build_factory(models: &ModelsSection) -> Result<Arc<dyn BackendFactory>, AgentError> {
    match models.backend.trim().to_lowercase().as_str() {
        "mock" => Ok(Arc::new(
            MockBackendFactory::new().with_default_footprint(models.default_footprint_bytes),
        )),
        "openai" | "" => Ok(Arc::new(OpenAiBackendFactory::from_config(models))),
        other => Err(AgentError::ConfigError(format!(
            "unknown models.backend '{}' (expected openai or mock)",
            other
        ))),
    }
}
