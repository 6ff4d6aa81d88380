//! 守护进程错误类型
//!
//! `DaemonError` 覆盖协议、持久化、配置与后端切换失败；`BackendError` 描述一次后端调用的失败原因，
//! 由调度器统一映射为 `BackendFailed` 结果，不会中断会话。

use thiserror::Error;

/// 守护进程内部错误（协议解析、IO、持久化、后端切换）
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Backend disabled: {0}")]
    BackendDisabled(String),
}

/// 一次后端调用失败的原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend call timed out after {0}s")]
    Timeout(u64),

    /// 等待共享后端超时（其他会话占用）
    #[error("Backend busy: waited {0}s for the shared backend")]
    Busy(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Backend returned an empty response")]
    EmptyResponse,

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// 是否值得重试：传输层与 5xx 错误可重试，其余直接返回
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transport(_) => true,
            BackendError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BackendError::Transport("reset".into()).is_retryable());
        assert!(BackendError::Status(503).is_retryable());
        assert!(!BackendError::Status(404).is_retryable());
        assert!(!BackendError::EmptyResponse.is_retryable());
        assert!(!BackendError::Timeout(30).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = DaemonError::BackendDisabled("phi3:mini".into());
        assert_eq!(err.to_string(), "Backend disabled: phi3:mini");
        let err = BackendError::Busy(5);
        assert!(err.to_string().contains("5s"));
    }
}
