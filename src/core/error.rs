//! 错误分类
//!
//! - ToolError：注册表误用（未知工具在运行中可恢复；重复注册在启动时致命）
//! - ModelLoadError / GenerationError：后端失败，对当前 run 致命，不自动重试
//! - AgentError：API 边界上的统一错误
//!
//! 解析失败不是错误（Parser 为全函数，返回 Malformed）；工具执行失败转为 Observation 字符串。

use thiserror::Error;

/// 工具注册表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool '{name}'. Available tools: {}", list_or_none(.available))]
    UnknownTool { name: String, available: Vec<String> },

    #[error("Duplicate tool: '{0}' is already registered")]
    DuplicateTool(String),

    #[error("Invalid tool descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

fn list_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// 模型加载失败：携带 model_id 与底层原因；可 Clone，所有合并等待者拿到同一个错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to load model '{model_id}': {cause}")]
pub struct ModelLoadError {
    pub model_id: String,
    pub cause: String,
}

impl ModelLoadError {
    pub fn new(model_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            cause: cause.into(),
        }
    }
}

/// 生成失败（后端崩溃或单次生成超时）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation failed on model '{model_id}': {cause}")]
    Backend { model_id: String, cause: String },

    #[error("Generation on model '{model_id}' timed out after {secs}s")]
    Timeout { model_id: String, secs: u64 },
}

/// 服务层统一错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Cancelled")]
    Cancelled,

    /// 模型正在加载或正在服务请求，不能卸载
    #[error("Model busy: {0}")]
    ModelBusy(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_lists_available() {
        let err = ToolError::UnknownTool {
            name: "fly".to_string(),
            available: vec!["calculator".to_string(), "read_file".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown tool 'fly'. Available tools: calculator, read_file"
        );
    }

    #[test]
    fn test_unknown_tool_with_empty_catalog() {
        let err = ToolError::UnknownTool {
            name: "fly".to_string(),
            available: vec![],
        };
        assert_eq!(err.to_string(), "Unknown tool 'fly'. Available tools: (none)");
    }

    #[test]
    fn test_model_load_error_converts() {
        let err: AgentError = ModelLoadError::new("m", "out of memory").into();
        assert!(matches!(err, AgentError::ModelLoad(_)));
        assert!(err.to_string().contains("'m'"));
        assert!(err.to_string().contains("out of memory"));
    }
}
