//! 学习日志（反馈存储）
//!
//! 记录「自然语言 → 被接受/拒绝的解释」，容量有界，满时淘汰最旧条目（FIFO）。
//! 每次 record 后整体落盘（紧凑 JSON）；落盘失败只记日志，内存中的日志仍是权威数据。

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::persistence::JsonFile;

/// 一条反馈
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub natural_command: String,
    pub interpreted_command: String,
    pub accepted: bool,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
}

/// 反馈存储：单锁保护的有界日志
pub struct FeedbackStore {
    entries: Mutex<VecDeque<FeedbackEntry>>,
    capacity: usize,
    file: Option<JsonFile>,
}

impl FeedbackStore {
    /// 纯内存存储（测试或未配置路径时使用）
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            file: None,
        }
    }

    /// 从文件加载；文件缺失或损坏时以空日志启动，超出容量时保留最新的条目
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Self {
        let file = JsonFile::new(path);
        let capacity = capacity.max(1);
        let mut entries: VecDeque<FeedbackEntry> = match file.load::<Vec<FeedbackEntry>>() {
            Ok(Some(list)) => list.into(),
            Ok(None) => VecDeque::new(),
            Err(e) => {
                tracing::warn!(path = %file.path().display(), error = %e, "feedback log unreadable, starting empty");
                VecDeque::new()
            }
        };
        while entries.len() > capacity {
            entries.pop_front();
        }
        tracing::info!(entries = entries.len(), capacity, "feedback store loaded");
        Self {
            entries: Mutex::new(entries),
            capacity,
            file: Some(file),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<FeedbackEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 追加一条反馈并落盘
    pub fn record(&self, natural: &str, interpreted: &str, accepted: bool, backend_name: &str) {
        let entry = FeedbackEntry {
            natural_command: natural.to_string(),
            interpreted_command: interpreted.to_string(),
            accepted,
            model_used: backend_name.to_string(),
            timestamp: Utc::now(),
        };

        {
            let mut entries = self.lock();
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
        tracing::debug!(natural = %natural, accepted, backend = %backend_name, "feedback recorded");
        self.save("failed to persist feedback log");
    }

    /// 整体落盘；文件写入期间不持有日志锁，suggest 不受影响
    fn save(&self, failure: &str) {
        let Some(file) = &self.file else {
            return;
        };
        let result = file.save_with(|| self.lock().iter().cloned().collect::<Vec<FeedbackEntry>>());
        if let Err(e) = result {
            tracing::warn!(path = %file.path().display(), error = %e, "{}", failure);
        }
    }

    /// 从新到旧查找被接受过的同一请求（忽略大小写）
    pub fn suggest(&self, natural: &str) -> Option<String> {
        let needle = natural.trim().to_lowercase();
        self.lock()
            .iter()
            .rev()
            .find(|e| e.accepted && e.natural_command.trim().to_lowercase() == needle)
            .map(|e| e.interpreted_command.clone())
    }

    /// 某个后端的 (接受数, 拒绝数)
    pub fn stats(&self, backend_name: &str) -> (usize, usize) {
        self.lock()
            .iter()
            .filter(|e| e.model_used == backend_name)
            .fold((0, 0), |(ok, rejected), e| {
                if e.accepted {
                    (ok + 1, rejected)
                } else {
                    (ok, rejected + 1)
                }
            })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 关闭前再落盘一次
    pub fn flush(&self) {
        self.save("failed to flush feedback log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = FeedbackStore::in_memory(1000);
        for i in 0..1001 {
            store.record(&format!("request {}", i), &format!("echo {}", i), true, "m");
        }
        assert_eq!(store.len(), 1000);
        assert!(store.suggest("request 0").is_none());
        assert_eq!(store.suggest("request 1").as_deref(), Some("echo 1"));
        assert_eq!(store.suggest("request 1000").as_deref(), Some("echo 1000"));
    }

    #[test]
    fn test_suggest_most_recent_accepted_case_insensitive() {
        let store = FeedbackStore::in_memory(10);
        store.record("List Files", "ls", true, "m");
        store.record("list files", "ls -la", true, "m");
        store.record("LIST FILES", "ls -R /", false, "m");

        assert_eq!(store.suggest("list FILES").as_deref(), Some("ls -la"));
        assert!(store.suggest("list file").is_none());
    }

    #[test]
    fn test_suggest_ignores_rejected_only() {
        let store = FeedbackStore::in_memory(10);
        store.record("reboot now", "reboot", false, "m");
        assert!(store.suggest("reboot now").is_none());
    }

    #[test]
    fn test_stats_per_backend() {
        let store = FeedbackStore::in_memory(10);
        store.record("a", "a", true, "phi3:mini");
        store.record("b", "b", false, "phi3:mini");
        store.record("c", "c", true, "phi3:mini");
        store.record("d", "d", true, "llama3.2:3b");
        assert_eq!(store.stats("phi3:mini"), (2, 1));
        assert_eq!(store.stats("llama3.2:3b"), (1, 0));
        assert_eq!(store.stats("unknown"), (0, 0));
    }

    #[test]
    fn test_persist_and_reload_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        {
            let store = FeedbackStore::open(&path, 5);
            for i in 0..5 {
                store.record(&format!("req {}", i), &format!("cmd {}", i), true, "m");
            }
        }
        let reloaded = FeedbackStore::open(&path, 3);
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.suggest("req 1").is_none());
        assert_eq!(reloaded.suggest("req 4").as_deref(), Some("cmd 4"));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        std::fs::write(&path, "[{broken").unwrap();
        let store = FeedbackStore::open(&path, 10);
        assert!(store.is_empty());
        store.record("x", "y", true, "m");
        assert_eq!(FeedbackStore::open(&path, 10).len(), 1);
    }

    #[test]
    fn test_concurrent_records_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        let store = std::sync::Arc::new(FeedbackStore::open(&path, 1000));
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.record(&format!("w{} r{}", worker, i), "true", true, "m");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(store.len(), 100);
        assert_eq!(FeedbackStore::open(&path, 1000).len(), 100);
    }

    #[test]
    fn test_persistence_failure_keeps_memory() {
        let dir = tempfile::tempdir().unwrap();
        // 父路径是普通文件，写入必然失败
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let store = FeedbackStore::open(blocker.join("learning.json"), 10);
        store.record("x", "y", true, "m");
        assert_eq!(store.len(), 1);
        assert_eq!(store.suggest("x").as_deref(), Some("y"));
    }
}
