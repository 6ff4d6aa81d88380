//! 本地 RPC 协议消息
//!
//! 每行一个 JSON 对象：客户端发送 Request，守护进程回复一个 Response，可在同一连接上重复。

use serde::{Deserialize, Serialize};

use crate::core::state::CounterSnapshot;
use crate::llm::{BackendSnapshot, TaskCategory};
use crate::safety::SafetyViolation;
use crate::tools::ExecutionResult;

/// 请求动作
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Interpret,
    Execute,
    Status,
    SetModel,
    GetContext,
    Classify,
    Chat,
    /// 客户端对待确认命令的决定
    Confirm,
    ListModels,
}

/// 客户端请求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreted_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    /// confirm 时回传产生解释的后端（interpret 响应中的 backend）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl Request {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// 非空的 command 字段
    pub fn command_text(&self) -> Option<&str> {
        self.command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// 响应状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Unsafe,
    Unclear,
    /// 被安全过滤器拦截
    Blocked,
}

/// 解释结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpretationSource {
    Backend,
    Feedback,
}

pub const BACKEND_UNKNOWN: &str = "unknown";
pub const BACKEND_REACHABLE: &str = "reachable";
pub const BACKEND_UNREACHABLE: &str = "unreachable";

/// status 动作的负载
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub daemon_status: &'static str,
    pub current_model: String,
    /// 当前后端的模型服务是否可达
    pub backend_status: &'static str,
    /// 模型服务上已安装的模型
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available_models: Vec<String>,
    pub auto_switch: bool,
    pub safety_mode: bool,
    pub confirmation_required: bool,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub uptime_secs: u64,
    pub counters: CounterSnapshot,
    pub feedback_entries: usize,
    pub feedback_capacity: usize,
    /// 当前后端在反馈日志中的 (接受, 拒绝)
    pub current_model_feedback: (usize, usize),
}

/// 守护进程响应
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreted_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<InterpretationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<TaskCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<SafetyViolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_report: Option<StatusReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<BackendSnapshot>>,
}

impl Response {
    pub fn new(status: ResponseStatus) -> Self {
        Self {
            status,
            message: None,
            interpreted_command: None,
            execution_result: None,
            exit_code: None,
            confirmation_required: None,
            source: None,
            backend: None,
            classification: None,
            chat_response: None,
            context: None,
            blocked_reason: None,
            status_report: None,
            models: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ResponseStatus::Success)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Error).with_message(message)
    }

    pub fn blocked(command: &str, violation: SafetyViolation) -> Self {
        let mut resp = Self::new(ResponseStatus::Blocked)
            .with_message(format!("Command blocked by safety filter: {}", violation.reason));
        resp.interpreted_command = Some(command.to_string());
        resp.blocked_reason = Some(violation);
        resp
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_execution(mut self, result: ExecutionResult) -> Self {
        self.execution_result = Some(result.output);
        self.exit_code = Some(result.exit_code);
        self
    }

    /// 序列化为一行 JSON（带换行）
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","message":"serialize error: {}"}}"#, e)
        });
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_to_interpret() {
        let req: Request = serde_json::from_str(r#"{"command":"list files"}"#).unwrap();
        assert_eq!(req.action, Action::Interpret);
        assert_eq!(req.command_text(), Some("list files"));
    }

    #[test]
    fn test_request_actions() {
        let req: Request = serde_json::from_str(r#"{"action":"set_model","model":"phi3:mini"}"#).unwrap();
        assert_eq!(req.action, Action::SetModel);
        assert_eq!(req.model.as_deref(), Some("phi3:mini"));

        let req: Request = serde_json::from_str(
            r#"{"action":"confirm","command":"x","interpreted_command":"ls","accepted":false}"#,
        )
        .unwrap();
        assert_eq!(req.action, Action::Confirm);
        assert_eq!(req.accepted, Some(false));

        assert!(serde_json::from_str::<Request>(r#"{"action":"explode"}"#).is_err());
    }

    #[test]
    fn test_blank_command_is_none() {
        let req = Request::new(Action::Interpret).with_command("   ");
        assert!(req.command_text().is_none());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let line = Response::success().with_backend("phi3:mini").to_line();
        assert!(line.ends_with('\n'));
        let json: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["backend"], "phi3:mini");
        assert!(json.get("execution_result").is_none());
        assert!(json.get("interpreted_command").is_none());
    }

    #[test]
    fn test_error_response() {
        let json = serde_json::to_value(Response::error("bad")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "bad");
    }
}
