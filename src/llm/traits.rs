//! 解释后端抽象
//!
//! 所有后端（Ollama HTTP / Mock）实现 InterpretBackend：interpret（命令解释）、chat（自由对话）。
//! RetryingBackend 为任意后端加上有界重试与递增等待。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::router::BackendConfig;
use crate::core::BackendError;

/// 后端在判定命令危险时输出的标记
pub const UNSAFE_MARKER: &str = "UNSAFE_COMMAND";
/// 后端无法理解请求时输出的标记
pub const UNCLEAR_MARKER: &str = "UNCLEAR_COMMAND";

/// 解释后端 trait
#[async_trait]
pub trait InterpretBackend: Send + Sync {
    /// 将自然语言请求翻译为 shell 命令，返回后端原文
    async fn interpret(
        &self,
        backend: &BackendConfig,
        prompt: &str,
        context_summary: &str,
    ) -> Result<String, BackendError>;

    /// 自由对话；默认与 interpret 相同
    async fn chat(
        &self,
        backend: &BackendConfig,
        prompt: &str,
        context_summary: &str,
    ) -> Result<String, BackendError> {
        self.interpret(backend, prompt, context_summary).await
    }

    /// 模型服务是否可达，返回其上可用的模型；默认视为可达且不列出模型
    async fn health(&self, _backend: &BackendConfig) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }
}

/// 一次解释的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum InterpretOutcome {
    Success(String),
    Unsafe,
    Unclear,
    BackendFailed(String),
}

impl InterpretOutcome {
    /// 将后端返回映射为结果：标记优先，空文本视为失败
    pub fn from_reply(reply: Result<String, BackendError>) -> Self {
        match reply {
            Ok(text) => {
                if text.contains(UNSAFE_MARKER) {
                    InterpretOutcome::Unsafe
                } else if text.contains(UNCLEAR_MARKER) {
                    InterpretOutcome::Unclear
                } else {
                    let command = clean_command(&text);
                    if command.is_empty() {
                        InterpretOutcome::BackendFailed(BackendError::EmptyResponse.to_string())
                    } else {
                        InterpretOutcome::Success(command)
                    }
                }
            }
            Err(e) => InterpretOutcome::BackendFailed(e.to_string()),
        }
    }

    /// 后端是否表现正常（用于路由统计）
    pub fn counts_as_success(&self) -> bool {
        matches!(self, InterpretOutcome::Success(_) | InterpretOutcome::Unsafe)
    }
}

/// 去掉 Markdown 代码围栏与首尾空白
fn clean_command(text: &str) -> String {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```")
        .map(|rest| {
            let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
            body.trim_end().strip_suffix("```").unwrap_or(body)
        })
        .unwrap_or(trimmed);
    unfenced.trim().to_string()
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待（线性递增）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.max(1)
    }
}

/// 带重试的后端包装
pub struct RetryingBackend {
    inner: Arc<dyn InterpretBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn InterpretBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn run<F, Fut>(&self, backend: &BackendConfig, call: F) -> Result<String, BackendError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<String, BackendError>> + Send,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.config.delay_for(attempt);
                    tracing::warn!(
                        backend = %backend.name,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl InterpretBackend for RetryingBackend {
    async fn interpret(
        &self,
        backend: &BackendConfig,
        prompt: &str,
        context_summary: &str,
    ) -> Result<String, BackendError> {
        self.run(backend, || self.inner.interpret(backend, prompt, context_summary))
            .await
    }

    async fn chat(
        &self,
        backend: &BackendConfig,
        prompt: &str,
        context_summary: &str,
    ) -> Result<String, BackendError> {
        self.run(backend, || self.inner.chat(backend, prompt, context_summary))
            .await
    }

    /// 健康检查不重试
    async fn health(&self, backend: &BackendConfig) -> Result<Vec<String>, BackendError> {
        self.inner.health(backend).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;

    fn backend() -> BackendConfig {
        BackendConfig {
            name: "mock".to_string(),
            description: String::new(),
            endpoint: String::new(),
            timeout_secs: 5,
            max_tokens: 64,
            temperature: 0.1,
            task_types: Vec::new(),
            priority: 0,
            enabled: true,
        }
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            InterpretOutcome::from_reply(Ok("ls -la\n".into())),
            InterpretOutcome::Success("ls -la".into())
        );
        assert_eq!(
            InterpretOutcome::from_reply(Ok("UNSAFE_COMMAND".into())),
            InterpretOutcome::Unsafe
        );
        assert_eq!(
            InterpretOutcome::from_reply(Ok("Sorry: UNCLEAR_COMMAND".into())),
            InterpretOutcome::Unclear
        );
        assert!(matches!(
            InterpretOutcome::from_reply(Ok("  \n".into())),
            InterpretOutcome::BackendFailed(_)
        ));
        assert!(matches!(
            InterpretOutcome::from_reply(Err(BackendError::Timeout(3))),
            InterpretOutcome::BackendFailed(_)
        ));
    }

    #[test]
    fn test_code_fence_stripped() {
        assert_eq!(
            InterpretOutcome::from_reply(Ok("```bash\ngit add . && git push\n```".into())),
            InterpretOutcome::Success("git add . && git push".into())
        );
    }

    #[test]
    fn test_delay_increases() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert!(config.delay_for(2) > config.delay_for(1));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let mock = Arc::new(MockBackend::new());
        mock.push_error(BackendError::Transport("connection refused".into()));
        mock.push_reply("uptime");
        let retrying = RetryingBackend::new(
            mock.clone(),
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        );
        let reply = retrying.interpret(&backend(), "how long up", "").await;
        assert_eq!(reply.unwrap(), "uptime");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_bounded() {
        let mock = Arc::new(MockBackend::new());
        for _ in 0..5 {
            mock.push_error(BackendError::Status(502));
        }
        let retrying = RetryingBackend::new(
            mock.clone(),
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        );
        let reply = retrying.interpret(&backend(), "x", "").await;
        assert_eq!(reply.unwrap_err(), BackendError::Status(502));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let mock = Arc::new(MockBackend::new());
        mock.push_error(BackendError::EmptyResponse);
        let retrying = RetryingBackend::new(mock.clone(), RetryConfig::default());
        assert!(retrying.interpret(&backend(), "x", "").await.is_err());
        assert_eq!(mock.call_count(), 1);
    }
}
