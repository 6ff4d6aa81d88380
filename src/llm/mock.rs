//! Mock 后端（用于测试，无需模型服务）
//!
//! 按顺序返回预置的回复或错误；队列为空时回显为 `echo <请求>`。
//! 记录同时进行中的调用数峰值，用于验证共享后端串行化。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::router::BackendConfig;
use super::traits::InterpretBackend;
use crate::core::BackendError;

#[derive(Debug, Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<Result<String, BackendError>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    health_error: Mutex<Option<BackendError>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次调用前等待一段时间（模拟慢后端）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_script().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: BackendError) {
        self.lock_script().push_back(Err(error));
    }

    /// 累计调用次数
    pub fn call_count(&self) -> usize {
        self.lock_calls().len()
    }

    /// 每次调用所用的后端名称
    pub fn backends_called(&self) -> Vec<String> {
        self.lock_calls().clone()
    }

    /// 同时进行中的调用数峰值
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// 之后的健康检查返回该错误
    pub fn fail_health(&self, error: BackendError) {
        *self.health_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, BackendError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl InterpretBackend for MockBackend {
    async fn interpret(
        &self,
        backend: &BackendConfig,
        prompt: &str,
        _context_summary: &str,
    ) -> Result<String, BackendError> {
        self.lock_calls().push(backend.name.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.lock_script().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("echo {}", prompt)))
    }

    async fn health(&self, backend: &BackendConfig) -> Result<Vec<String>, BackendError> {
        match self.health_error.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(error) => Err(error),
            None => Ok(vec![backend.name.clone()]),
        }
    }
}
