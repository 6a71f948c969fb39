//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOOL_AGENT__*` 覆盖（双下划线表示嵌套，
//! 如 `TOOL_AGENT__AGENT__MAX_ITERATIONS=5`）。旧版单变量（MODEL_PATH、PORT 等）由 apply_legacy_env 处理。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub agent: AgentSection,
    pub models: ModelsSection,
    pub tools: ToolsSection,
}

/// [server] 段：监听地址与 API Key
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    /// 允许的 API Key；为空时启动时生成一个并打印到日志
    pub api_keys: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            api_keys: Vec::new(),
        }
    }
}

/// [agent] 段：默认模型与运行预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub default_model: String,
    pub max_iterations: usize,
    pub max_wall_time_secs: u64,
    /// 单次生成超时，避免一次卡住的后端调用悄悄耗尽整体预算
    pub generation_timeout_secs: u64,
    pub max_new_tokens: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            default_model: "mistralai/Mistral-7B-Instruct-v0.2".to_string(),
            max_iterations: 10,
            max_wall_time_secs: 300,
            generation_timeout_secs: 120,
            max_new_tokens: 1024,
        }
    }
}

/// [models] 段：后端类型与显存预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    /// openai（OpenAI 兼容推理服务）/ mock
    pub backend: String,
    pub memory_budget_bytes: u64,
    /// 未在 endpoints 中声明 footprint 的模型按此估算
    pub default_footprint_bytes: u64,
    /// model_id -> 端点；未声明的 model_id 使用 default_base_url
    pub endpoints: HashMap<String, EndpointSection>,
    pub default_base_url: Option<String>,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            backend: "openai".to_string(),
            memory_budget_bytes: 24 * GIB,
            default_footprint_bytes: 15 * GIB,
            endpoints: HashMap::new(),
            default_base_url: None,
        }
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

/// [models.endpoints.<id>] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointSection {
    pub base_url: Option<String>,
    /// 推理服务端使用的模型名；缺省为 model_id
    pub served_name: Option<String>,
    /// 读取 API Key 的环境变量名；缺省 OPENAI_API_KEY
    pub api_key_env: Option<String>,
    pub footprint_bytes: Option<u64>,
    pub temperature: Option<f32>,
}

/// [tools] 段：工作区根、工具超时、启用列表与各内置工具设置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 文件类工具的沙箱根目录
    pub workspace_root: PathBuf,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 启用的内置工具；为空表示全部
    pub enabled: Vec<String>,
    pub shell: ShellSection,
    pub web: WebSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./workspace"),
            tool_timeout_secs: 30,
            enabled: Vec::new(),
            shell: ShellSection::default(),
            web: WebSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
    pub default_timeout_secs: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "cat", "head", "tail", "wc", "grep", "find", "echo", "date", "pwd"]
                .into_iter()
                .map(String::from)
                .collect(),
            default_timeout_secs: 30,
        }
    }
}

/// [tools.web] 段：抓取超时、最大字符数、域名白名单（含子域名）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: [
                "wikipedia.org",
                "github.com",
                "raw.githubusercontent.com",
                "stackoverflow.com",
                "docs.rs",
                "crates.io",
                "doc.rust-lang.org",
                "docs.python.org",
                "developer.mozilla.org",
                "arxiv.org",
                "news.ycombinator.com",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TOOL_AGENT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOOL_AGENT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOOL_AGENT")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("server.api_keys")
            .with_list_parse_key("tools.enabled")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 旧版部署使用的单个环境变量：MODEL_PATH、MAX_NEW_TOKENS、HOST、PORT、INITIAL_API_KEY
pub fn apply_legacy_env(cfg: &mut AppConfig) {
    apply_legacy_vars(cfg, |k| std::env::var(k).ok());
}

fn apply_legacy_vars(cfg: &mut AppConfig, get: impl Fn(&str) -> Option<String>) {
    if let Some(model) = get("MODEL_PATH").filter(|s| !s.trim().is_empty()) {
        cfg.agent.default_model = model.trim().to_string();
    }
    if let Some(n) = get("MAX_NEW_TOKENS").and_then(|s| s.trim().parse().ok()) {
        cfg.agent.max_new_tokens = n;
    }
    let host = get("HOST").filter(|s| !s.trim().is_empty());
    let port = get("PORT").and_then(|s| s.trim().parse::<u16>().ok());
    if host.is_some() || port.is_some() {
        let (cur_host, cur_port) = match cfg.server.bind_addr.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap_or(8000)),
            None => (cfg.server.bind_addr.clone(), 8000),
        };
        cfg.server.bind_addr = format!(
            "{}:{}",
            host.unwrap_or(cur_host),
            port.unwrap_or(cur_port)
        );
    }
    if let Some(key) = get("INITIAL_API_KEY").filter(|s| !s.trim().is_empty()) {
        let key = key.trim().to_string();
        if !cfg.server.api_keys.contains(&key) {
            cfg.server.api_keys.push(key);
        }
    }
}
