//! 守护进程共享状态（组合根）
//!
//! 启动时构建一次，以 `Arc<DaemonState>` 传给监听循环与所有会话 worker；关闭时在所有 worker join 之后落盘。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};

use super::error::{BackendError, DaemonError};
use super::shutdown::ShutdownManager;
use crate::config::AppConfig;
use crate::gateway::{SessionTable, StatusReport, BACKEND_UNKNOWN};
use crate::llm::{build_entries, BackendRegistry, InterpretBackend, ModelRouter, RouterSettings};
use crate::memory::FeedbackStore;
use crate::safety::SafetyFilter;
use crate::tools::CommandRunner;

/// 状态计数器
#[derive(Debug, Default)]
pub struct StatusCounters {
    total_requests: AtomicU64,
    successful_interpretations: AtomicU64,
    failed_interpretations: AtomicU64,
    blocked_commands: AtomicU64,
    rejected_connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total_requests: u64,
    pub successful_interpretations: u64,
    pub failed_interpretations: u64,
    pub blocked_commands: u64,
    pub rejected_connections: u64,
}

impl StatusCounters {
    pub fn request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interpretation(&self, success: bool) {
        let counter = if success {
            &self.successful_interpretations
        } else {
            &self.failed_interpretations
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocked(&self) {
        self.blocked_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_interpretations: self.successful_interpretations.load(Ordering::Relaxed),
            failed_interpretations: self.failed_interpretations.load(Ordering::Relaxed),
            blocked_commands: self.blocked_commands.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
        }
    }
}

/// 运行期不变的设置
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub safety_mode: bool,
    pub confirmation_required: bool,
    pub backend_wait: Duration,
    pub context_ttl: Duration,
    pub history_capacity: usize,
    pub max_request_bytes: usize,
}

/// 守护进程共享状态
pub struct DaemonState {
    pub settings: DaemonSettings,
    pub router: ModelRouter,
    pub feedback: FeedbackStore,
    pub backend: Arc<dyn InterpretBackend>,
    backend_gate: Semaphore,
    pub runner: CommandRunner,
    pub safety: SafetyFilter,
    pub counters: StatusCounters,
    pub sessions: SessionTable,
    pub shutdown: Arc<ShutdownManager>,
    started_at: Instant,
}

impl DaemonState {
    /// 由配置构建；注册表与反馈日志路径未配置时只保存在内存
    pub fn from_config(
        config: &AppConfig,
        backend: Arc<dyn InterpretBackend>,
    ) -> Result<Self, DaemonError> {
        let registry = config.router.registry_path.as_ref().map(BackendRegistry::new);
        let records = registry.as_ref().map(|r| r.load()).unwrap_or_default();
        let entries = build_entries(&config.effective_backends(), &records);

        let mut router = ModelRouter::new(
            entries,
            &config.daemon.default_model,
            RouterSettings {
                auto_switch: config.router.auto_switch,
                cooldown: Duration::from_secs(config.router.switch_cooldown_secs),
            },
        )?;
        if let Some(registry) = registry {
            router = router.with_registry(registry);
        }

        let feedback = match &config.feedback.path {
            Some(path) => FeedbackStore::open(path, config.feedback.capacity),
            None => FeedbackStore::in_memory(config.feedback.capacity),
        };

        if !config.daemon.safety_mode {
            tracing::warn!("safety_mode=false is ignored: the safety filter always runs before execution");
        }

        Ok(Self {
            settings: DaemonSettings {
                safety_mode: config.daemon.safety_mode,
                confirmation_required: config.daemon.confirmation_required,
                backend_wait: Duration::from_secs(config.router.backend_wait_secs),
                context_ttl: Duration::from_secs(config.context.ttl_secs),
                history_capacity: config.context.history_capacity,
                max_request_bytes: config.daemon.max_request_bytes,
            },
            router,
            feedback,
            backend,
            backend_gate: Semaphore::new(1),
            runner: CommandRunner::new(config.daemon.exec_timeout_secs, config.daemon.max_output_bytes),
            safety: SafetyFilter::new(),
            counters: StatusCounters::default(),
            sessions: SessionTable::new(config.daemon.max_sessions),
            shutdown: Arc::new(ShutdownManager::new()),
            started_at: Instant::now(),
        })
    }

    /// 在限定时间内获取共享后端
    pub async fn acquire_backend(&self) -> Result<SemaphorePermit<'_>, BackendError> {
        match tokio::time::timeout(self.settings.backend_wait, self.backend_gate.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(BackendError::Transport("backend gate closed".to_string())),
            Err(_) => Err(BackendError::Busy(self.settings.backend_wait.as_secs())),
        }
    }

    pub fn status_report(&self) -> StatusReport {
        let current_model = self.router.current_name();
        StatusReport {
            daemon_status: if self.shutdown.is_shutdown() {
                "stopping"
            } else {
                "running"
            },
            current_model_feedback: self.feedback.stats(&current_model),
            current_model,
            backend_status: BACKEND_UNKNOWN,
            available_models: Vec::new(),
            auto_switch: self.router.auto_switch(),
            safety_mode: self.settings.safety_mode,
            confirmation_required: self.settings.confirmation_required,
            active_sessions: self.sessions.active_count(),
            max_sessions: self.sessions.capacity(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            counters: self.counters.snapshot(),
            feedback_entries: self.feedback.len(),
            feedback_capacity: self.feedback.capacity(),
        }
    }

    /// 落盘反馈日志与后端注册表
    pub fn persist(&self) {
        self.feedback.flush();
        self.router.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;

    fn in_memory_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.router.registry_path = None;
        cfg.feedback.path = None;
        cfg
    }

    #[test]
    fn test_from_config_defaults() {
        let state = DaemonState::from_config(&in_memory_config(), Arc::new(MockBackend::new())).unwrap();
        assert_eq!(state.router.current_name(), "codellama:7b-instruct");
        let report = state.status_report();
        assert_eq!(report.daemon_status, "running");
        assert_eq!(report.max_sessions, 64);
        assert_eq!(report.active_sessions, 0);
        assert!(report.confirmation_required);
        assert_eq!(report.counters, CounterSnapshot::default());
    }

    #[test]
    fn test_counters() {
        let counters = StatusCounters::default();
        counters.request();
        counters.request();
        counters.interpretation(true);
        counters.interpretation(false);
        counters.blocked();
        let snap = counters.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.successful_interpretations, 1);
        assert_eq!(snap.failed_interpretations, 1);
        assert_eq!(snap.blocked_commands, 1);
    }

    #[tokio::test]
    async fn test_backend_gate_times_out() {
        let mut cfg = in_memory_config();
        cfg.router.backend_wait_secs = 0;
        let state = DaemonState::from_config(&cfg, Arc::new(MockBackend::new())).unwrap();
        let held = state.acquire_backend().await.unwrap();
        assert!(matches!(state.acquire_backend().await, Err(BackendError::Busy(0))));
        drop(held);
        assert!(state.acquire_backend().await.is_ok());
    }

    #[test]
    fn test_registry_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = in_memory_config();
        cfg.router.registry_path = Some(dir.path().join("models.json"));
        let state = DaemonState::from_config(&cfg, Arc::new(MockBackend::new())).unwrap();
        state.router.record_outcome("phi3:mini", true, 1.0);
        state.persist();

        let reloaded = DaemonState::from_config(&cfg, Arc::new(MockBackend::new())).unwrap();
        assert_eq!(reloaded.router.stats("phi3:mini").unwrap().success_count, 1);
    }
}
