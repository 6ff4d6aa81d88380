//! 网关：本地 RPC 与内核通道
//!
//! - **hub**: Unix socket 监听循环，每个连接一个会话 worker
//! - **session**: 会话与固定容量的会话表
//! - **message**: 换行分隔的 JSON 请求/响应
//! - **dispatcher**: 按 action 分发请求（解释、执行、确认、状态、切换模型等）
//! - **bridge**: 内核通道契约的进程内回环

mod bridge;
mod dispatcher;
mod hub;
mod message;
mod session;

pub use bridge::{
    KernelBridge, KernelChannel, KernelRequest, KernelResponse, RESULT_FAILED, RESULT_OK,
    RESULT_UNCLEAR, RESULT_UNSAFE,
};
pub use dispatcher::{Dispatcher, Resolution};
pub use hub::SessionManager;
pub use message::{
    Action, InterpretationSource, Request, Response, ResponseStatus, StatusReport,
    BACKEND_REACHABLE, BACKEND_UNKNOWN, BACKEND_UNREACHABLE,
};
pub use session::{DispatchState, Session, SessionTable, SessionTicket};
