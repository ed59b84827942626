//! Shell 工具：白名单命令
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cat）；禁止 rm -rf、mkfs 等危险子串。
//! 非零退出码不是执行失败，而是把退出码与输出一起作为结果返回，留给模型自己解读。

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::Tool;

/// 禁止的命令/子串（即使白名单中有同名命令，带这些参数也不允许）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "chmod 777",
    ":(){ :|:& };:", // fork bomb
];

/// 白名单 Shell 工具
pub struct ShellTool {
    allowed_commands: HashSet<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self {
            allowed_commands: allowed_commands
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if !self.allowed_commands.contains(name) {
            return Err(format!("Command '{}' not in allowlist", name));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command and return its output. Args: {\"command\": \"ls -la\"}"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let raw = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "shell requires a string \"command\" argument".to_string())?;
        self.check(raw)?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(raw)
            .output()
            .await
            .map_err(|e| format!("spawn failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut result = String::new();
        if !stdout.is_empty() {
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str("stderr: ");
            result.push_str(&stderr);
        }
        if !output.status.success() {
            // ExitStatus 的 Display 形如 "exit status: 1"
            result = format!("{}\n{}", output.status, result);
        }
        if result.is_empty() {
            result.push_str("(no output)");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ShellTool {
        ShellTool::new(vec!["echo".into(), "false".into()])
    }

    #[tokio::test]
    async fn allowlisted_command_runs() {
        let out = tool()
            .execute(serde_json::json!({"command": "echo hi"}))
            .await
            .unwrap();
        assert!(out.contains("hi"));
    }

    #[tokio::test]
    async fn unlisted_command_is_rejected() {
        let err = tool()
            .execute(serde_json::json!({"command": "wget http://x"}))
            .await
            .unwrap_err();
        assert!(err.contains("allowlist"));
    }

    #[tokio::test]
    async fn forbidden_pattern_is_rejected_even_for_allowed_name() {
        let err = tool()
            .execute(serde_json::json!({"command": "echo hi && rm -rf /"}))
            .await
            .unwrap_err();
        assert!(err.contains("Forbidden"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_failed() {
        let out = tool()
            .execute(serde_json::json!({"command": "false"}))
            .await
            .unwrap();
        assert!(out.contains("exit status"));
    }
}
