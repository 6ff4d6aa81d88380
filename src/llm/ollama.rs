//! Ollama 兼容 HTTP 客户端
//!
//! `POST {endpoint}/generate`，非流式；模型名、超时与生成参数取自当前 BackendConfig。
//! `GET {endpoint}/tags` 用于健康检查并列出已安装的模型。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::router::BackendConfig;
use super::traits::InterpretBackend;
use crate::core::BackendError;

const DEFAULT_CONTEXT: &str = "Current directory, standard user permissions";

fn command_system_prompt(context_summary: &str) -> String {
    let context = if context_summary.trim().is_empty() {
        DEFAULT_CONTEXT
    } else {
        context_summary
    };
    format!(
        "You are an assistant that translates natural language requests into Linux shell commands.\n\
         Rules:\n\
         1. Output only the shell command, no explanations.\n\
         2. If the request is dangerous, output UNSAFE_COMMAND.\n\
         3. If the request is ambiguous, output UNCLEAR_COMMAND.\n\
         4. Take the context into account: {context}\n\n\
         Examples:\n\
         Input: git push and add all files\n\
         Output: git add . && git push\n\n\
         Input: install python package numpy\n\
         Output: pip install numpy\n\n\
         Input: list files in current directory\n\
         Output: ls -la\n"
    )
}

fn chat_system_prompt(context_summary: &str) -> String {
    format!(
        "You are a concise assistant running on a Linux workstation. \
         Answer the user directly and briefly. Context: {}",
        if context_summary.trim().is_empty() {
            DEFAULT_CONTEXT
        } else {
            context_summary
        }
    )
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: String,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Ollama 客户端（共享一个 reqwest 连接池）
#[derive(Debug, Clone, Default)]
pub struct OllamaBackend {
    http: reqwest::Client,
}

impl OllamaBackend {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn generate(
        &self,
        backend: &BackendConfig,
        system: String,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let url = format!("{}/generate", backend.endpoint.trim_end_matches('/'));
        let body = GenerateRequest {
            model: &backend.name,
            system,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: backend.temperature,
                num_predict: backend.max_tokens,
            },
        };

        tracing::debug!(backend = %backend.name, %url, "calling backend");
        let resp = self
            .http
            .post(&url)
            .timeout(backend.timeout())
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, backend))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let text = parsed.response.ok_or(BackendError::EmptyResponse)?;
        Ok(text.trim_end_matches(['\n', '\r']).to_string())
    }

    async fn list_models(&self, backend: &BackendConfig) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/tags", backend.endpoint.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .timeout(backend.timeout())
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, backend))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

fn map_reqwest_error(e: reqwest::Error, backend: &BackendConfig) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(backend.timeout_secs)
    } else {
        BackendError::Transport(e.to_string())
    }
}

#[async_trait]
impl InterpretBackend for OllamaBackend {
    async fn interpret(
        &self,
        backend: &BackendConfig,
        prompt: &str,
        context_summary: &str,
    ) -> Result<String, BackendError> {
        self.generate(backend, command_system_prompt(context_summary), prompt)
            .await
    }

    async fn chat(
        &self,
        backend: &BackendConfig,
        prompt: &str,
        context_summary: &str,
    ) -> Result<String, BackendError> {
        self.generate(backend, chat_system_prompt(context_summary), prompt)
            .await
    }

    async fn health(&self, backend: &BackendConfig) -> Result<Vec<String>, BackendError> {
        self.list_models(backend).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = GenerateRequest {
            model: "phi3:mini",
            system: command_system_prompt("User: bob@host in /tmp"),
            prompt: "list files",
            stream: false,
            options: GenerateOptions {
                temperature: 0.2,
                num_predict: 256,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "phi3:mini");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 256);
        assert!(json["system"].as_str().unwrap().contains("bob@host"));
        assert!(json["system"].as_str().unwrap().contains("UNSAFE_COMMAND"));
    }

    #[test]
    fn test_tags_response_parsing() {
        let tags: TagsResponse = serde_json::from_str(
            r#"{"models":[{"name":"phi3:mini","size":1},{"name":"mistral:7b-instruct"}]}"#,
        )
        .unwrap();
        let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["phi3:mini", "mistral:7b-instruct"]);
        let empty: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.models.is_empty());
    }

    #[test]
    fn test_empty_context_uses_default() {
        assert!(command_system_prompt("").contains(DEFAULT_CONTEXT));
        assert!(chat_system_prompt("  ").contains(DEFAULT_CONTEXT));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let backend = BackendConfig {
            name: "phi3:mini".to_string(),
            description: String::new(),
            // 端口 9 (discard) 通常未监听
            endpoint: "http://127.0.0.1:9/api".to_string(),
            timeout_secs: 2,
            max_tokens: 16,
            temperature: 0.1,
            task_types: Vec::new(),
            priority: 0,
            enabled: true,
        };
        let err = OllamaBackend::new()
            .interpret(&backend, "ls", "")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport(_) | BackendError::Timeout(_)));
    }
}
