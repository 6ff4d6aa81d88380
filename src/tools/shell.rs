//! Shell 执行器：通过 sh -c 运行已通过安全过滤的命令
//!
//! 捕获 stdout + stderr（合并、截断到上限）与退出码，带超时与 tracing 审计。

use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    /// 被信号终止或超时时为 -1
    pub exit_code: i32,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    max_output_bytes: usize,
}

impl CommandRunner {
    pub fn new(timeout_secs: u64, max_output_bytes: usize) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs.max(1)),
            max_output_bytes: max_output_bytes.max(1),
        }
    }

    /// 在给定目录执行命令；调用方负责先做安全检查
    pub async fn run(&self, command: &str, cwd: Option<&str>) -> ExecutionResult {
        tracing::info!(command = %command, cwd = ?cwd, "executing command");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).kill_on_drop(true);
        if let Some(dir) = cwd.filter(|d| std::path::Path::new(d).is_dir()) {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(command = %command, error = %e, "failed to spawn command");
                return ExecutionResult {
                    output: format!("Execution failed: {}", e),
                    exit_code: -1,
                    truncated: false,
                };
            }
            Err(_) => {
                tracing::warn!(command = %command, timeout_secs = self.timeout.as_secs(), "command timed out");
                return ExecutionResult {
                    output: format!("Command timed out after {}s", self.timeout.as_secs()),
                    exit_code: -1,
                    truncated: false,
                };
            }
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let truncated = combined.len() > self.max_output_bytes;
        combined.truncate(self.max_output_bytes);

        let exit_code = output.status.code().unwrap_or(-1);
        tracing::info!(command = %command, exit_code, bytes = combined.len(), "command finished");
        ExecutionResult {
            output: String::from_utf8_lossy(&combined).into_owned(),
            exit_code,
            truncated,
        }
    }
}
