//! 守护进程的运行标志
//!
//! 监听循环、会话 worker 与内核桥接都持有同一个 CancellationToken，在两次消息之间检查它；
//! SIGINT / SIGTERM 或测试代码调用 `trigger` 将其取消。只记录第一次触发的原因。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 停止原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT（Ctrl+C）
    Interrupt,
    /// SIGTERM
    Terminate,
    Requested(String),
}

pub struct ShutdownManager {
    running: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            running: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.running.clone()
    }

    /// 取消运行标志；之后的调用只被忽略
    pub fn trigger(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return;
            }
            tracing::info!(?reason, "daemon stopping");
            *slot = Some(reason);
        }
        self.running.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.running.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn stopped(&self) {
        self.running.cancelled().await;
    }

    /// 监听 SIGINT 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        if term.recv().await.is_some() {
                            manager.trigger(ShutdownReason::Terminate);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);
        manager.trigger(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_first_reason_kept() {
        let manager = ShutdownManager::new();
        manager.trigger(ShutdownReason::Terminate);
        manager.trigger(ShutdownReason::Requested("test".into()));
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
        manager.stopped().await;
    }
}
