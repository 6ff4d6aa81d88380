//! 后端注册表持久化
//!
//! 文件记录每个后端的启用状态、优先级、基础分与统计；启动时按名称覆盖配置中的后端。

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::router::{BackendConfig, BackendStats};
use crate::config::BackendSection;
use crate::core::DaemonError;
use crate::memory::JsonFile;

/// 注册表中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub name: String,
    pub enabled: bool,
    pub priority: u32,
    pub performance_score: f64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub avg_response_time: f64,
}

impl RegistryRecord {
    pub fn from_parts(config: &BackendConfig, stats: &BackendStats) -> Self {
        Self {
            name: config.name.clone(),
            enabled: config.enabled,
            priority: config.priority,
            performance_score: stats.base_score,
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            avg_response_time: stats.avg_response_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    file: JsonFile,
}

impl BackendRegistry {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    /// 读取注册表；缺失或损坏时返回空列表
    pub fn load(&self) -> Vec<RegistryRecord> {
        match self.file.load::<Vec<RegistryRecord>>() {
            Ok(Some(records)) => records,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.file.path().display(), error = %e, "backend registry unreadable, using configured values");
                Vec::new()
            }
        }
    }

    pub fn save(&self, records: &[RegistryRecord]) -> Result<(), DaemonError> {
        self.file.save(records)
    }

    /// 在写锁内生成记录再写入，并发保存按顺序完成
    pub fn save_with<F>(&self, records: F) -> Result<(), DaemonError>
    where
        F: FnOnce() -> Vec<RegistryRecord>,
    {
        self.file.save_with(records)
    }
}

/// 由配置与注册表记录组装路由器条目
pub fn build_entries(
    sections: &[BackendSection],
    records: &[RegistryRecord],
) -> Vec<(BackendConfig, BackendStats)> {
    sections
        .iter()
        .map(|section| {
            let mut config = BackendConfig {
                name: section.name.clone(),
                description: section.description.clone(),
                endpoint: section.endpoint.trim_end_matches('/').to_string(),
                timeout_secs: section.timeout_secs,
                max_tokens: section.max_tokens,
                temperature: section.temperature,
                task_types: section.task_types.clone(),
                priority: section.priority,
                enabled: section.enabled,
            };
            let mut stats = BackendStats::with_prior(section.performance_score);
            if let Some(record) = records.iter().find(|r| r.name == section.name) {
                config.enabled = record.enabled;
                config.priority = record.priority;
                stats.base_score = record.performance_score;
                stats.success_count = record.success_count;
                stats.failure_count = record.failure_count;
                stats.avg_response_time = record.avg_response_time;
            }
            (config, stats)
        })
        .collect()
}
