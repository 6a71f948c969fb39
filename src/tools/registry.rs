//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters / output_description / execute），
//! 注册时校验描述符（名称唯一、名称与参数名合法），启动后只读，lookup / invoke 无需加锁。
//!
//! invoke 的约定：只有「未知工具」返回 Err；参数校验失败、handler 返回 Err、handler panic、
//! 超时都转为 Observation 字符串，保证工具执行永远不会中止 Agent 运行。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{validate_args, ParamTable};

/// 单次工具调用默认超时（秒）
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
/// 审计日志中参数预览最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// 工具 trait：元数据（供 Prompt 与 /tools 列表）+ 异步执行（args 为已校验的 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应模型输出中的 `Action: <name>`）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    /// 参数声明；默认无参数
    fn parameters(&self) -> ParamTable {
        ParamTable::new()
    }

    /// 输出说明
    fn output_description(&self) -> &str {
        "Plain text result."
    }

    /// 执行工具；Err 中的信息会以 `Error executing tool '<name>': <message>` 反馈给模型
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具元数据（不含 handler），用于 Prompt 目录渲染与外部工具列表接口
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParamTable,
    #[serde(rename = "output")]
    pub output_description: String,
}

/// 已注册工具：注册时固定下来的描述符 + 实现
struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn Tool>,
}

/// 工具注册表：保持注册顺序，按名索引
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
    timeout: Duration,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs.max(1));
        self
    }

    /// 注册工具：重复名称返回 DuplicateTool（保留先注册者），描述符不合法返回 InvalidDescriptor
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), ToolError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let definition = ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
            output_description: tool.output_description().to_string(),
        };
        check_definition(&definition)?;
        if self.index.contains_key(&definition.name) {
            return Err(ToolError::DuplicateTool(definition.name));
        }
        tracing::info!(tool = %definition.name, "Registered tool");
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            handler: tool,
        });
        Ok(())
    }

    /// 按名查找描述符
    pub fn lookup(&self, name: &str) -> Result<&ToolDefinition, ToolError> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i].definition)
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_string(),
                available: self.tool_names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// 按注册顺序返回全部工具元数据
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.definition.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 调用工具；仅未知工具返回 Err（handler 不会被调用），其余失败均为 Ok(Observation)
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        let idx = *self.index.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
            available: self.tool_names(),
        })?;
        let tool = &self.tools[idx];

        let args = match validate_args(&tool.definition.parameters, arguments) {
            Ok(a) => a,
            Err(msg) => {
                tracing::warn!(tool = %name, error = %msg, "tool arguments rejected");
                return Ok(format!("Error: invalid arguments for tool '{name}': {msg}"));
            }
        };

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let call = AssertUnwindSafe(tool.handler.execute(args)).catch_unwind();
        let result = tokio::time::timeout(self.timeout, call).await;

        let outcome = match &result {
            Ok(Ok(Ok(_))) => "ok",
            Ok(Ok(Err(_))) => "error",
            Ok(Err(_)) => "panic",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        Ok(match result {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(msg))) => execution_error(name, &msg),
            Ok(Err(panic)) => execution_error(name, &panic_message(panic.as_ref())),
            Err(_) => execution_error(
                name,
                &format!("timed out after {}s", self.timeout.as_secs()),
            ),
        })
    }
}

fn execution_error(name: &str, message: &str) -> String {
    format!("Error executing tool '{name}': {message}")
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}

/// 注册期校验：名称非空且不含空白（模型按行解析 Action 名），参数名非空
fn check_definition(def: &ToolDefinition) -> Result<(), ToolError> {
    let invalid = |reason: &str| ToolError::InvalidDescriptor {
        name: def.name.clone(),
        reason: reason.to_string(),
    };
    if def.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if def.name.chars().any(char::is_whitespace) {
        return Err(invalid("name must not contain whitespace"));
    }
    if def.description.trim().is_empty() {
        return Err(invalid("description must not be empty"));
    }
    if def.parameters.keys().any(|k| k.trim().is_empty()) {
        return Err(invalid("parameter names must not be empty"));
    }
    Ok(())
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{ParamSpec, ParamType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "counts calls"
        }

        fn parameters(&self) -> ParamTable {
            let mut p = ParamTable::new();
            p.insert("text".into(), ParamSpec::required(ParamType::String, "text"));
            p
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("disk on fire".to_string())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Tool for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn description(&self) -> &str {
            "always panics"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            panic!("index out of bounds")
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "never returns in time"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".to_string())
        }
    }

    fn counting(name: &'static str) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Counting {
                name,
                calls: calls.clone(),
            },
            calls,
        )
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = ToolRegistry::new();
        let (first, _) = counting("echo");
        let (second, _) = counting("echo");
        registry.register(first).unwrap();
        let err = registry.register(second).unwrap_err();
        assert_eq!(err, ToolError::DuplicateTool("echo".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_name_rejected_at_registration() {
        let mut registry = ToolRegistry::new();
        let (tool, _) = counting("two words");
        assert!(matches!(
            registry.register(tool),
            Err(ToolError::InvalidDescriptor { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_definitions_in_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(counting("zeta").0).unwrap();
        registry.register(counting("alpha").0).unwrap();
        let names: Vec<_> = registry.list_definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert!(registry.lookup("alpha").is_ok());
    }

    #[test]
    fn test_debug_lists_tool_names() {
        let mut registry = ToolRegistry::new().with_timeout(5);
        registry.register(counting("echo").0).unwrap();
        let shown = format!("{:?}", registry);
        assert!(shown.contains("\"echo\""));
        assert!(shown.contains("5s"));
    }

    #[tokio::test]
    async fn test_unknown_tool_never_calls_a_handler() {
        let mut registry = ToolRegistry::new();
        let (tool, calls) = counting("echo");
        registry.register(tool).unwrap();
        for name in ["Echo", "echo2", "", "calculator"] {
            let err = registry.invoke(name, json!({"text": "x"})).await.unwrap_err();
            assert!(matches!(err, ToolError::UnknownTool { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_argument_is_observation_not_error() {
        let mut registry = ToolRegistry::new();
        let (tool, calls) = counting("echo");
        registry.register(tool).unwrap();
        let obs = registry.invoke("echo", json!({})).await.unwrap();
        assert!(obs.contains("missing required parameter(s): text"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_observations() {
        let mut registry = ToolRegistry::new();
        registry.register(Failing).unwrap();
        registry.register(Panicking).unwrap();

        let obs = registry.invoke("failing", json!({})).await.unwrap();
        assert_eq!(obs, "Error executing tool 'failing': disk on fire");

        let obs = registry.invoke("panicking", json!({})).await.unwrap();
        assert!(obs.starts_with("Error executing tool 'panicking':"));
        assert!(obs.contains("index out of bounds"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_observation() {
        let mut registry = ToolRegistry::new().with_timeout(2);
        registry.register(Sleepy).unwrap();
        let obs = registry.invoke("sleepy", json!({})).await.unwrap();
        assert_eq!(obs, "Error executing tool 'sleepy': timed out after 2s");
    }
}
