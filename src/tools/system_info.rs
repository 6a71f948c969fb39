//! system_info：主机与进程信息
//!
//! type = basic（默认）| env | all。环境变量中名字含 TOKEN / SECRET / PASSWORD / KEY 的值一律打码。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::schema::{ParamSpec, ParamTable, ParamType};
use crate::tools::Tool;

const SENSITIVE_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "KEY"];

pub struct SystemInfoTool;

fn is_sensitive(name: &str) -> bool {
    let upper = name.to_uppercase();
    SENSITIVE_MARKERS.iter().any(|m| upper.contains(m))
}

fn basic_info() -> String {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!(
        "Basic System Information:\n\
         OS: {}\n\
         Family: {}\n\
         Architecture: {}\n\
         CPUs: {}\n\
         Process ID: {}\n\
         Working directory: {}\n\
         Time (UTC): {}\n",
        std::env::consts::OS,
        std::env::consts::FAMILY,
        std::env::consts::ARCH,
        cpus,
        std::process::id(),
        cwd,
        chrono::Utc::now().to_rfc3339(),
    )
}

fn env_info() -> String {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    let mut out = String::from("Environment Variables:\n");
    for (k, v) in vars {
        let shown = if is_sensitive(&k) { "[REDACTED]".to_string() } else { v };
        out.push_str(&format!("{}={}\n", k, shown));
    }
    out
}

#[async_trait]
impl Tool for SystemInfoTool {
    fn name(&self) -> &str {
        "system_info"
    }

    fn description(&self) -> &str {
        "Get information about the host system."
    }

    fn parameters(&self) -> ParamTable {
        let mut p = ParamTable::new();
        p.insert(
            "type".into(),
            ParamSpec::optional(
                ParamType::String,
                "Type of information: basic, env, or all (default: basic).",
            ),
        );
        p
    }

    fn output_description(&self) -> &str {
        "System information as text."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let kind = args
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("basic")
            .trim()
            .to_lowercase();
        match kind.as_str() {
            "" | "basic" => Ok(basic_info()),
            "env" => Ok(env_info()),
            "all" => Ok(format!("{}\n{}", basic_info(), env_info())),
            other => Err(format!("Unknown info type '{}'. Use basic, env, or all.", other)),
        }
    }
}
