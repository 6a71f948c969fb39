//! 工具箱：注册表、参数声明与校验、内置工具（calculator / 文件 / shell / 系统信息 / 网页）

pub mod calculator;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod shell;
pub mod system_info;
pub mod web;

pub use calculator::CalculatorTool;
pub use filesystem::{ListDirectoryTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{Tool, ToolDefinition, ToolRegistry};
pub use schema::{ParamSpec, ParamTable, ParamType};
pub use shell::RunCommandTool;
pub use system_info::SystemInfoTool;
pub use web::WebPageReaderTool;
