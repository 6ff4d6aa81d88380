//! aios-daemon - 自然语言命令解释守护进程
//!
//! 入口：初始化日志、加载配置、构建共享状态，启动内核通道回环与 Unix socket 监听循环，
//! 收到 Ctrl+C / SIGTERM 后等待所有会话结束并落盘。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aios::config::load_config;
use aios::core::DaemonState;
use aios::gateway::{KernelBridge, SessionManager};
use aios::llm::{OllamaBackend, RetryConfig, RetryingBackend};
use anyhow::Context;

/// 内核通道队列长度
const KERNEL_QUEUE: usize = 32;

/// `--config <path>` 优先，其次环境变量 AIOS_CONFIG
fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("AIOS_CONFIG").map(PathBuf::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aios::observability::init();

    let cfg = load_config(config_path()).context("Failed to load config")?;

    let backend = RetryingBackend::new(
        Arc::new(OllamaBackend::new()),
        RetryConfig {
            max_attempts: cfg.retry.max_attempts,
            base_delay: Duration::from_millis(cfg.retry.base_delay_ms),
        },
    );
    let state = Arc::new(
        DaemonState::from_config(&cfg, Arc::new(backend)).context("Failed to build daemon state")?,
    );
    state.shutdown.install_signal_handlers();

    tracing::info!(
        model = %state.router.current_name(),
        backends = state.router.backends().len(),
        confirmation_required = state.settings.confirmation_required,
        "aios daemon starting"
    );

    // 通道发送端随 main 存活；桥接在关闭信号到来时退出
    let (bridge, _kernel_channel) = KernelBridge::new(Arc::clone(&state), KERNEL_QUEUE);
    let bridge_task = tokio::spawn(bridge.run());

    let manager = SessionManager::bind(Arc::clone(&state), &cfg.daemon.socket_path)
        .context("Failed to bind daemon socket")?;
    manager.serve().await.context("Session manager failed")?;

    if let Err(e) = bridge_task.await {
        tracing::warn!(error = %e, "kernel bridge task failed");
    }
    state.persist();
    tracing::info!(reason = ?state.shutdown.reason(), "aios daemon stopped");
    Ok(())
}
