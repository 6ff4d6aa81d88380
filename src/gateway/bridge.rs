//! 内核通道桥接
//!
//! 内核拦截路径只通过请求/响应结构与守护进程交互：`{id, pid, command, context}` →
//! `{id, result_code, interpreted_command, error_message}`。这里用进程内 mpsc 回环承载该契约，
//! 解释路径与本地 RPC 相同（路由、反馈捷径、共享后端），结果码映射：0 成功，-1 失败，-2 危险，-3 不明确。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::dispatcher::Dispatcher;
use crate::core::{DaemonError, DaemonState};
use crate::llm::InterpretOutcome;

pub const RESULT_OK: i32 = 0;
pub const RESULT_FAILED: i32 = -1;
pub const RESULT_UNSAFE: i32 = -2;
pub const RESULT_UNCLEAR: i32 = -3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRequest {
    pub id: u64,
    pub pid: i32,
    pub command: String,
    /// 调用方提供的上下文摘要
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelResponse {
    pub id: u64,
    pub result_code: i32,
    pub interpreted_command: String,
    pub error_message: String,
}

impl KernelResponse {
    pub fn from_outcome(id: u64, outcome: InterpretOutcome) -> Self {
        let (result_code, interpreted_command, error_message) = match outcome {
            InterpretOutcome::Success(cmd) => (RESULT_OK, cmd, String::new()),
            InterpretOutcome::Unsafe => (RESULT_UNSAFE, String::new(), "unsafe command".to_string()),
            InterpretOutcome::Unclear => (RESULT_UNCLEAR, String::new(), "unclear command".to_string()),
            InterpretOutcome::BackendFailed(reason) => (RESULT_FAILED, String::new(), reason),
        };
        Self {
            id,
            result_code,
            interpreted_command,
            error_message,
        }
    }
}

type Envelope = (KernelRequest, oneshot::Sender<KernelResponse>);

/// 提交请求的一端（可克隆）
#[derive(Clone)]
pub struct KernelChannel {
    tx: mpsc::Sender<Envelope>,
}

impl KernelChannel {
    pub async fn submit(&self, request: KernelRequest) -> Result<KernelResponse, DaemonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| DaemonError::Protocol("kernel bridge stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| DaemonError::Protocol("kernel bridge dropped the request".to_string()))
    }
}

/// 处理内核请求的一端
pub struct KernelBridge {
    dispatcher: Dispatcher,
    state: Arc<DaemonState>,
    rx: mpsc::Receiver<Envelope>,
}

impl KernelBridge {
    pub fn new(state: Arc<DaemonState>, capacity: usize) -> (Self, KernelChannel) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let bridge = Self {
            dispatcher: Dispatcher::new(Arc::clone(&state)),
            state,
            rx,
        };
        (bridge, KernelChannel { tx })
    }

    pub async fn handle(&self, request: KernelRequest) -> KernelResponse {
        tracing::debug!(id = request.id, pid = request.pid, command = %request.command, "kernel request");
        if request.command.trim().is_empty() {
            return KernelResponse::from_outcome(
                request.id,
                InterpretOutcome::BackendFailed("empty command".to_string()),
            );
        }
        let resolution = self
            .dispatcher
            .resolve(request.command.trim(), &request.context)
            .await;
        KernelResponse::from_outcome(request.id, resolution.outcome)
    }

    /// 逐个处理请求，直到关闭或所有提交端释放
    pub async fn run(mut self) {
        let token = self.state.shutdown.token();
        loop {
            let envelope = tokio::select! {
                _ = token.cancelled() => break,
                envelope = self.rx.recv() => envelope,
            };
            let Some((request, reply)) = envelope else {
                break;
            };
            let response = self.handle(request).await;
            if reply.send(response).is_err() {
                tracing::debug!("kernel request abandoned by caller");
            }
        }
        tracing::info!("kernel bridge stopped");
    }
}
