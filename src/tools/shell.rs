//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串；
//! 执行通过 sh -c / cmd /C。超时由分发器控制，取消时子进程随 kill_on_drop 一起结束。

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::tools::{Tool, ToolContext};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
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
    ":(){ :|:& };:", // fork bomb
];

/// Shell 工具：仅允许白名单内命令
pub struct ShellTool {
    allowed_commands: HashSet<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self { allowed_commands }
    }

    fn check_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {forbidden}"));
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{name}' not in allowlist"))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command and return exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The shell command to execute (first word must be in allowlist)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check_allowed(command)?;

        tracing::info!(command = %command, execution_id = %ctx.execution_id, "shell tool execute");

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

        let output = tokio::select! {
            _ = ctx.cancelled() => return Err("Command interrupted".to_string()),
            out = cmd.output() => out.map_err(|e| format!("Execution failed: {e}"))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status.code(), stderr));
        }
        Ok(serde_json::json!({
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext {
            execution_id: "exec_test".to_string(),
            iteration_index: 0,
            cancel: CancellationToken::new(),
            deadline: tokio::time::Instant::now() + std::time::Duration::from_secs(5),
        }
    }

    #[test]
    fn test_allowlist() {
        let tool = ShellTool::new(vec!["ls".into(), "ECHO".into()]);
        assert!(tool.check_allowed("ls -la").is_ok());
        assert!(tool.check_allowed("echo hi").is_ok());
        assert!(tool.check_allowed("cat /etc/passwd").is_err());
        assert!(tool.check_allowed("ls; rm -rf /").is_err());
        assert!(tool.check_allowed("   ").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_allowed_command() {
        let tool = ShellTool::new(vec!["echo".into()]);
        let mut args = Map::new();
        args.insert("command".into(), Value::String("echo hive".into()));
        let out = tool.invoke(ctx(), args).await.unwrap();
        assert_eq!(out["stdout"], "hive");
        assert_eq!(out["exit_code"], 0);
    }
}
