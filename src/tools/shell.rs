//! run_command：白名单命令执行，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、date）；禁止 rm -rf、wget、chmod 777 等子串；
//! 通过 sh -c / cmd /C 执行，带超时；非零退出码不算工具失败，原样报告给模型。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::schema::{ParamSpec, ParamTable, ParamType};
use crate::tools::Tool;

/// 禁止的子串（即使命令名在白名单中）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 单条命令允许的最长超时（秒）
const MAX_TIMEOUT_SECS: u64 = 300;

pub struct RunCommandTool {
    allowed_commands: HashSet<String>,
    default_timeout_secs: u64,
}

impl RunCommandTool {
    pub fn new(allowed_commands: Vec<String>, default_timeout_secs: u64) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            default_timeout_secs,
        }
    }

    fn check_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("command is required".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{}' not in allowlist", name))
        }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command and get its output. Only allow-listed commands may run."
    }

    fn parameters(&self) -> ParamTable {
        let mut p = ParamTable::new();
        p.insert(
            "command".into(),
            ParamSpec::required(ParamType::String, "The command to run."),
        );
        p.insert(
            "timeout".into(),
            ParamSpec::optional(ParamType::Integer, "Optional timeout in seconds (default: 30)."),
        );
        p
    }

    fn output_description(&self) -> &str {
        "The command output (stdout and stderr) and return code."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check_allowed(command)?;
        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs)
            .clamp(1, MAX_TIMEOUT_SECS);

        tracing::info!(command = %command, "run_command execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
            .await
            .map_err(|_| {
                format!("Command timed out after {} seconds: {}", timeout_secs, command)
            })?
            .map_err(|e| format!("Error running command: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());

        let mut result = format!("Command: {}\nExit code: {}\n\n", command, code);
        if !stdout.is_empty() {
            result.push_str(&format!("STDOUT:\n{}\n", stdout));
        }
        if !stderr.is_empty() {
            result.push_str(&format!("STDERR:\n{}\n", stderr));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool() -> RunCommandTool {
        RunCommandTool::new(vec!["echo".into(), "ls".into(), "rm".into()], 5)
    }

    #[test]
    fn test_allowlist_and_forbidden() {
        let t = tool();
        assert!(t.check_allowed("echo hi").is_ok());
        assert!(t.check_allowed("ECHO hi").is_ok());
        assert!(t.check_allowed("cat /etc/passwd").unwrap_err().contains("not in allowlist"));
        assert!(t.check_allowed("rm -rf /").unwrap_err().contains("Forbidden"));
        assert!(t.check_allowed("   ").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reports_exit_code_and_stdout() {
        let out = tool().execute(json!({"command": "echo hello"})).await.unwrap();
        assert!(out.starts_with("Command: echo hello\nExit code: 0\n"));
        assert!(out.contains("STDOUT:\nhello"));
    }
}
