//! 核心层：错误类型、优雅关闭、守护进程共享状态

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{BackendError, DaemonError};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{CounterSnapshot, DaemonSettings, DaemonState, StatusCounters};
