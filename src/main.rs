//! Tool Agent 服务入口
//!
//! 初始化日志、加载配置、装配组件并启动 HTTP 网关；收到 Ctrl+C / SIGTERM 后停止接收请求，
//! 取消活跃 run 并卸载已加载的模型。

use std::sync::Arc;

use anyhow::Context;
use tool_agent::{
    agent::AgentComponents,
    config::{apply_legacy_env, load_config},
    core::{CancelRunsCleanup, ShutdownCoordinator, ShutdownManager, UnloadModelsCleanup},
    gateway::{self, auth::generate_key, ApiKeyStore, AppState},
    observability,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let mut cfg = load_config(config_path).context("Failed to load configuration")?;
    apply_legacy_env(&mut cfg);

    if cfg.server.api_keys.is_empty() {
        let key = generate_key();
        tracing::info!("No API key configured. Generated: {}", key);
        cfg.server.api_keys.push(key);
    }
    let api_keys = ApiKeyStore::with_keys(cfg.server.api_keys.clone());
    let bind_addr = cfg.server.bind_addr.clone();

    let components =
        Arc::new(AgentComponents::from_config(cfg).context("Failed to build agent components")?);
    tracing::info!(
        tools = ?components.registry.tool_names(),
        default_model = %components.default_model(),
        budget_bytes = components.manager.memory_usage().budget_bytes,
        "agent initialized"
    );

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(CancelRunsCleanup::new(components.runs.clone()));
    coordinator.register(UnloadModelsCleanup::new(Arc::clone(&components.manager)));

    let state = Arc::new(AppState::new(Arc::clone(&components), api_keys));
    let app = gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Tool Agent API: http://{}", bind_addr);

    let signal = shutdown.clone();
    let cancel_runs = components.runs.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.wait().await;
            // 先取消 run，流式连接才能在下一个步骤边界结束
            cancel_runs.cancel_all();
        })
        .await
        .context("Server error")?;

    coordinator.run_cleanup().await;
    tracing::info!(reason = ?shutdown.reason(), "shutdown complete");
    Ok(())
}
