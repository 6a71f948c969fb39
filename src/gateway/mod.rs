//! 请求网关（HTTP）
//!
//! axum 路由：认证、请求校验，把请求交给 AgentLoop；结果以 JSON 返回，或以 NDJSON 流式推送
//! （每行一个 RunEvent：run_started / step / finished）。
//!
//! - GET  /                  服务信息与端点列表
//! - GET  /health            健康检查（无需 Key）
//! - GET  /models            模型注册表快照与显存使用
//! - DELETE /models/:id      卸载模型（忙 409，不存在 404）
//! - GET  /tools             工具目录
//! - POST /agent             运行并返回 AgentRun
//! - POST /agent/stream      运行并推送 NDJSON 事件
//! - GET  /runs              活跃 run
//! - POST /runs/:id/cancel   取消 run
//! - POST/GET /api-keys, DELETE /api-keys/:key_id   Key 管理

pub mod auth;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::agent::AgentComponents;
use crate::core::AgentError;
use crate::react::{AgentRun, FewShotExample, HistoryTurn, RunEvent, RunRequest};

pub use auth::{ApiKeyStore, IssuedKey, KeyInfo, API_KEY_HEADER};

/// 单次请求可设置的最大迭代次数上限
pub const MAX_ITERATIONS_LIMIT: usize = 100;

/// 网关共享状态
pub struct AppState {
    pub components: Arc<AgentComponents>,
    pub api_keys: ApiKeyStore,
}

impl AppState {
    pub fn new(components: Arc<AgentComponents>, api_keys: ApiKeyStore) -> Self {
        Self {
            components,
            api_keys,
        }
    }
}

/// POST /agent 与 /agent/stream 的请求体
#[derive(Debug, Clone, Deserialize)]
pub struct AgentQuery {
    pub query: String,
    #[serde(default, alias = "model_name")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub max_wall_time_secs: Option<u64>,
    /// 本次启用的工具子集；缺省或空列表表示全部
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default, alias = "conversation_history")]
    pub history: Option<Vec<HistoryTurn>>,
    #[serde(default)]
    pub examples: Option<Vec<FewShotExample>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateKeyRequest {
    pub key_name: String,
}

type ApiError = (StatusCode, String);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, msg.into())
}

/// 构建路由；/health 之外的路由都经过 API Key 校验
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/", get(service_info))
        .route("/models", get(list_models))
        .route("/models/:id", delete(unload_model))
        .route("/tools", get(list_tools))
        .route("/agent", post(run_agent))
        .route("/agent/stream", post(run_agent_stream))
        .route("/runs", get(list_runs))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/api-keys", post(create_api_key).get(list_api_keys))
        .route("/api-keys/:key_id", delete(delete_api_key))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();
    let res = next.run(req).await;
    tracing::info!(
        method = %method,
        path = %path,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    res
}

/// 校验请求并转为 RunRequest（run_id 在此生成）
pub fn build_run_request(
    components: &AgentComponents,
    q: AgentQuery,
) -> Result<RunRequest, ApiError> {
    let query = q.query.trim();
    if query.is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if let Some(n) = q.max_iterations {
        if n == 0 || n > MAX_ITERATIONS_LIMIT {
            return Err(bad_request(format!(
                "max_iterations must be between 1 and {}",
                MAX_ITERATIONS_LIMIT
            )));
        }
    }
    if q.max_wall_time_secs == Some(0) {
        return Err(bad_request("max_wall_time_secs must be positive"));
    }

    let allowed_tools = match q.tools {
        Some(tools) if !tools.is_empty() => {
            let available = components.registry.tool_names();
            if let Some(unknown) = tools.iter().find(|t| !available.contains(*t)) {
                return Err(bad_request(format!(
                    "Tool '{}' not found. Available tools: {}",
                    unknown,
                    available.join(", ")
                )));
            }
            Some(tools)
        }
        _ => None,
    };

    let model_id = q
        .model_id
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| components.default_model().to_string());

    Ok(RunRequest {
        run_id: Some(uuid::Uuid::new_v4().to_string()),
        query: query.to_string(),
        model_id,
        max_iterations: q.max_iterations,
        max_wall_time: q.max_wall_time_secs.map(Duration::from_secs),
        allowed_tools,
        history: q.history.unwrap_or_default(),
        examples: q.examples.unwrap_or_default(),
    })
}

async fn service_info() -> Json<Value> {
    Json(json!({
        "name": "Tool Agent API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "ReAct-style tool use over managed language models",
        "endpoints": [
            {"path": "/", "method": "GET", "description": "This information"},
            {"path": "/health", "method": "GET", "description": "Liveness check (no key required)"},
            {"path": "/models", "method": "GET", "description": "Model registry snapshot"},
            {"path": "/models/{id}", "method": "DELETE", "description": "Unload an idle model"},
            {"path": "/tools", "method": "GET", "description": "List all available tools"},
            {"path": "/agent", "method": "POST", "description": "Run the agent with a query"},
            {"path": "/agent/stream", "method": "POST", "description": "Run the agent and stream NDJSON events"},
            {"path": "/runs", "method": "GET", "description": "List active runs"},
            {"path": "/runs/{id}/cancel", "method": "POST", "description": "Cancel an active run"},
            {"path": "/api-keys", "method": "POST", "description": "Create a new API key"},
            {"path": "/api-keys", "method": "GET", "description": "List all API keys"},
            {"path": "/api-keys/{key_id}", "method": "DELETE", "description": "Delete an API key"},
        ]
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let components = &state.components;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models_resident": components.manager.list_models().len(),
        "active_runs": components.runs.active_runs().len(),
    }))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let manager = &state.components.manager;
    Json(json!({
        "default_model": state.components.default_model(),
        "models": manager.list_models(),
        "memory": manager.memory_usage(),
    }))
}

async fn unload_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.components.manager.unload(&id).await {
        Ok(()) => Ok(Json(json!({ "model_id": id, "unloaded": true }))),
        Err(e @ AgentError::ModelBusy(_)) => Err((StatusCode::CONFLICT, e.to_string())),
        Err(e @ AgentError::ModelNotLoaded(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "tools": state.components.registry.list_definitions() }))
}

/// 同步运行：run 在独立任务中执行，客户端断开只触发取消，进行中的工具调用照常完成
async fn run_agent(
    State(state): State<Arc<AppState>>,
    Json(q): Json<AgentQuery>,
) -> Result<Json<AgentRun>, ApiError> {
    let components = &state.components;
    let request = build_run_request(components, q)?;
    let guard = components
        .runs
        .register(request.run_id.clone().unwrap_or_default());
    let cancel_on_disconnect = guard.token().drop_guard();

    let agent_loop = Arc::clone(&components.agent_loop);
    let handle = tokio::spawn(async move {
        let run = agent_loop.run(request, guard.token(), None).await;
        drop(guard);
        run
    });
    let run = handle.await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Run task failed: {}", e),
        )
    })?;
    cancel_on_disconnect.disarm();
    Ok(Json(run))
}

/// 流式运行：客户端断开后在下一个步骤边界取消 run
async fn run_agent_stream(
    State(state): State<Arc<AppState>>,
    Json(q): Json<AgentQuery>,
) -> Result<Response, ApiError> {
    let components = Arc::clone(&state.components);
    let request = build_run_request(&components, q)?;
    let guard = components
        .runs
        .register(request.run_id.clone().unwrap_or_default());
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();

    tokio::spawn(async move {
        let token = guard.token();
        let run = components.agent_loop.run(request, token.clone(), Some(&event_tx));
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = event_tx.closed() => {
                tracing::info!(run_id = %guard.run_id(), "stream client went away, cancelling run");
                token.cancel();
                run.await;
            }
        }
        drop(guard);
    });

    let stream = stream::unfold(event_rx, |mut rx| async move {
        let ev = rx.recv().await?;
        let line = match serde_json::to_string(&ev) {
            Ok(s) => format!("{}\n", s),
            Err(e) => format!("{}\n", json!({ "type": "error", "message": e.to_string() })),
        };
        Some((Ok::<Bytes, Infallible>(Bytes::from(line)), rx))
    });

    let mut res = Response::new(Body::from_stream(stream));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson; charset=utf-8"),
    );
    Ok(res)
}

async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "runs": state.components.runs.active_runs() }))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.components.runs.cancel(&id) {
        Ok(Json(json!({ "run_id": id, "cancelled": true })))
    } else {
        Err((StatusCode::NOT_FOUND, format!("Run not found: {}", id)))
    }
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Json<IssuedKey>, ApiError> {
    let name = req.key_name.trim();
    if name.is_empty() {
        return Err(bad_request("key_name must not be empty"));
    }
    Ok(Json(state.api_keys.issue(name).await))
}

async fn list_api_keys(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "api_keys": state.api_keys.list().await }))
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.api_keys.revoke(&key_id).await {
        Ok(Json(json!({ "status": "success", "message": "API key deleted" })))
    } else {
        Err((StatusCode::NOT_FOUND, "API key not found".to_string()))
    }
}
