//! 多模型路由器
//!
//! 根据请求的任务类别自动选择综合得分最高的已启用后端：
//! - 分类：按类别统计关键词/短语命中数，最高者胜，平局取声明顺序靠前者，全零为 general
//! - 评分：`0.7 * 成功率 + 0.3 * (基础分 - 平均耗时 / 10)`，再加优先级加成
//! - 切换：冷却期内不自动切换，手动切换不受冷却限制
//!
//! 两把锁：路由锁（当前后端 + 上次切换时间）与统计锁（各后端计数与得分），从不同时持有。

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::registry::{RegistryRecord, BackendRegistry};
use crate::core::DaemonError;

/// 后端注册表上限
pub const MAX_BACKENDS: usize = 16;

/// 统计达到该次数后才重新计算基础分
pub const SCORE_STABILIZATION_THRESHOLD: u64 = 10;

/// 任务类别（声明顺序即平局时的优先顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    File,
    Process,
    Network,
    System,
    Development,
    Data,
    Security,
    General,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 8] = [
        TaskCategory::File,
        TaskCategory::Process,
        TaskCategory::Network,
        TaskCategory::System,
        TaskCategory::Development,
        TaskCategory::Data,
        TaskCategory::Security,
        TaskCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::File => "file",
            TaskCategory::Process => "process",
            TaskCategory::Network => "network",
            TaskCategory::System => "system",
            TaskCategory::Development => "development",
            TaskCategory::Data => "data",
            TaskCategory::Security => "security",
            TaskCategory::General => "general",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown task category: {}", s))
    }
}

/// 各类别的关键词与短语（general 没有，作为兜底）
const CATEGORY_PATTERNS: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::File,
        &[
            r"\bfiles?\b",
            r"\bdocuments?\b",
            r"\bfolders?\b",
            r"\bdirector(?:y|ies)\b",
            r"\bpaths?\b",
            r"\bls\b",
            r"\bfind\b",
            r"\bgrep\b",
            r"\bcat\b",
            r"\bhead\b",
            r"\btail\b",
            r"\bcp\b",
            r"\bmv\b",
            r"\brm\b",
            r"\bmkdir\b",
            r"\btouch\b",
            r"\b(?:show|list|copy|move|delete|create)\b.*\b(?:files?|folders?|director(?:y|ies))\b",
        ],
    ),
    (
        TaskCategory::Process,
        &[
            r"\bprocess(?:es)?\b",
            r"\bps\b",
            r"\bkill\b",
            r"\bpkill\b",
            r"\bpgrep\b",
            r"\btop\b",
            r"\bhtop\b",
            r"\bsystemctl\b",
            r"\bservices?\b",
            r"\bdaemons?\b",
            r"\b(?:start|stop|restart)\b.*\b(?:services?|daemons?)\b",
        ],
    ),
    (
        TaskCategory::Network,
        &[
            r"\bnetwork\b",
            r"\bconnections?\b",
            r"\bports?\b",
            r"\bsockets?\b",
            r"\bhttps?\b",
            r"\bftp\b",
            r"\bssh\b",
            r"\btelnet\b",
            r"\bping\b",
            r"\bcurl\b",
            r"\bwget\b",
            r"\b(?:download|upload)\b",
        ],
    ),
    (
        TaskCategory::System,
        &[
            r"\bsystem\b",
            r"\bhardware\b",
            r"\bcpu\b",
            r"\bmemory\b",
            r"\bram\b",
            r"\bdisk\b",
            r"\bstorage\b",
            r"\bperformance\b",
            r"\bmonitor\b",
            r"\bresources?\b",
            r"\b(?:check|show)\b.*\b(?:usage|space)\b",
        ],
    ),
    (
        TaskCategory::Development,
        &[
            r"\bcode\b",
            r"\bcoding\b",
            r"\bdevelopment\b",
            r"\bprogramming\b",
            r"\bcompile\b",
            r"\bbuild\b",
            r"\bdeploy\b",
            r"\bgit\b",
            r"\bgithub\b",
            r"\brepo(?:sitory)?\b",
            r"\bgit\b.*\b(?:push|pull|commit|clone|merge|add)\b",
            r"\b(?:commit|push|stage)\b.*\bchanges\b",
        ],
    ),
    (
        TaskCategory::Data,
        &[
            r"\bdata\b",
            r"\bdatabases?\b",
            r"\bdb\b",
            r"\bsql\b",
            r"\bnosql\b",
            r"\bquer(?:y|ies)\b",
            r"\bsearch\b",
            r"\bfilter\b",
            r"\bsort\b",
            r"\bexport\b",
            r"\bimport\b",
        ],
    ),
    (
        TaskCategory::Security,
        &[
            r"\bsecurity\b",
            r"\bpermissions?\b",
            r"\baccess\b",
            r"\bauthentication\b",
            r"\bauthorization\b",
            r"\blogin\b",
            r"\busers?\b",
            r"\bgroups?\b",
            r"\bsudo\b",
            r"\bchmod\b",
            r"\bchown\b",
        ],
    ),
];

/// 任务类别分类器
pub struct TaskClassifier {
    categories: Vec<(TaskCategory, Vec<Regex>)>,
}

impl TaskClassifier {
    fn new() -> Self {
        let categories = CATEGORY_PATTERNS
            .iter()
            .map(|(category, patterns)| {
                let compiled = patterns
                    .iter()
                    .filter_map(|p| match Regex::new(p) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            tracing::error!(%category, pattern = %p, error = %e, "invalid classifier pattern");
                            None
                        }
                    })
                    .collect();
                (*category, compiled)
            })
            .collect();
        Self { categories }
    }

    fn shared() -> &'static TaskClassifier {
        static CLASSIFIER: OnceLock<TaskClassifier> = OnceLock::new();
        CLASSIFIER.get_or_init(TaskClassifier::new)
    }

    /// 各类别命中数（按声明顺序）
    pub fn scores(command: &str) -> Vec<(TaskCategory, usize)> {
        let lower = command.to_lowercase();
        Self::shared()
            .categories
            .iter()
            .map(|(category, patterns)| {
                (*category, patterns.iter().filter(|re| re.is_match(&lower)).count())
            })
            .collect()
    }

    /// 推断请求的任务类别
    pub fn classify(command: &str) -> TaskCategory {
        let mut best = TaskCategory::General;
        let mut best_count = 0;
        for (category, count) in Self::scores(command) {
            if count > best_count {
                best = category;
                best_count = count;
            }
        }
        best
    }
}

/// 后端身份与路由数据（启动后不变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub description: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub task_types: Vec<TaskCategory>,
    /// 越小越优先
    pub priority: u32,
    pub enabled: bool,
}

impl BackendConfig {
    pub fn supports(&self, category: TaskCategory) -> bool {
        self.task_types.contains(&category)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// 后端运行统计（只由 record_outcome 修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub success_count: u64,
    pub failure_count: u64,
    /// 平均响应时间（秒）
    pub avg_response_time: f64,
    /// 基础分：初始为配置的先验分，样本足够后按表现重算
    pub base_score: f64,
    /// 本次运行中基础分被重算的次数
    #[serde(skip)]
    pub recomputations: u64,
}

impl BackendStats {
    pub fn with_prior(prior: f64) -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            avg_response_time: 0.0,
            base_score: prior,
            recomputations: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// 成功率，无数据时为 0
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.success_count as f64 / total as f64,
        }
    }
}

/// 状态/列表接口使用的后端快照
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    #[serde(flatten)]
    pub config: BackendConfig,
    #[serde(flatten)]
    pub stats: BackendStats,
    pub success_rate: f64,
    pub current: bool,
}

/// 路由器配置
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub auto_switch: bool,
    pub cooldown: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            auto_switch: true,
            cooldown: Duration::from_secs(300),
        }
    }
}

struct RoutingState {
    current: usize,
    last_switch: Option<Instant>,
}

/// 多模型路由器
pub struct ModelRouter {
    backends: Vec<BackendConfig>,
    stats: RwLock<Vec<BackendStats>>,
    routing: Mutex<RoutingState>,
    auto_switch: AtomicBool,
    cooldown: Duration,
    max_priority: u32,
    registry: Option<BackendRegistry>,
}

impl ModelRouter {
    /// 创建路由器；超过 MAX_BACKENDS 的条目被丢弃，默认后端不存在或未启用时取第一个已启用后端
    pub fn new(
        mut entries: Vec<(BackendConfig, BackendStats)>,
        default_model: &str,
        settings: RouterSettings,
    ) -> Result<Self, DaemonError> {
        if entries.is_empty() {
            return Err(DaemonError::Config("no backends configured".to_string()));
        }
        if entries.len() > MAX_BACKENDS {
            tracing::warn!(
                configured = entries.len(),
                max = MAX_BACKENDS,
                "too many backends, extra entries ignored"
            );
            entries.truncate(MAX_BACKENDS);
        }
        let (backends, stats): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let max_priority = backends.iter().map(|b| b.priority).max().unwrap_or(0);

        let current = match backends.iter().position(|b| b.name == default_model && b.enabled) {
            Some(idx) => idx,
            None => {
                let fallback = first_enabled(&backends);
                tracing::warn!(
                    requested = %default_model,
                    using = %backends[fallback].name,
                    "default backend unavailable, falling back"
                );
                fallback
            }
        };

        Ok(Self {
            backends,
            stats: RwLock::new(stats),
            routing: Mutex::new(RoutingState {
                current,
                last_switch: None,
            }),
            auto_switch: AtomicBool::new(settings.auto_switch),
            cooldown: settings.cooldown,
            max_priority,
            registry: None,
        })
    }

    /// 关联注册表文件，统计变化后落盘
    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    fn routing(&self) -> MutexGuard<'_, RoutingState> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_stats(&self) -> std::sync::RwLockReadGuard<'_, Vec<BackendStats>> {
        self.stats.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_stats(&self) -> std::sync::RwLockWriteGuard<'_, Vec<BackendStats>> {
        self.stats.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn backends(&self) -> &[BackendConfig] {
        &self.backends
    }

    /// 当前后端
    pub fn current(&self) -> BackendConfig {
        let idx = self.routing().current;
        self.backends[idx].clone()
    }

    pub fn current_name(&self) -> String {
        let idx = self.routing().current;
        self.backends[idx].name.clone()
    }

    pub fn set_auto_switch(&self, enabled: bool) {
        self.auto_switch.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_switch(&self) -> bool {
        self.auto_switch.load(Ordering::Relaxed)
    }

    fn composite_score(&self, backend: &BackendConfig, stats: &BackendStats) -> f64 {
        let base = stats.base_score - stats.avg_response_time / 10.0;
        let score = 0.7 * stats.success_rate() + 0.3 * base;
        score + (self.max_priority - backend.priority.min(self.max_priority)) as f64 * 0.01
    }

    fn select_best_index(&self, category: TaskCategory) -> usize {
        let stats = self.read_stats();
        let mut best: Option<(usize, f64)> = None;
        for (idx, backend) in self.backends.iter().enumerate() {
            if !backend.enabled || !backend.supports(category) {
                continue;
            }
            let score = self.composite_score(backend, &stats[idx]);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        best.map(|(idx, _)| idx)
            .unwrap_or_else(|| first_enabled(&self.backends))
    }

    /// 为类别选择综合得分最高的后端
    pub fn select_best(&self, category: TaskCategory) -> BackendConfig {
        self.backends[self.select_best_index(category)].clone()
    }

    fn cooling_down(&self, state: &RoutingState, now: Instant) -> bool {
        state
            .last_switch
            .map_or(false, |last| now.saturating_duration_since(last) < self.cooldown)
    }

    /// 根据请求内容自动切换后端，返回是否发生切换
    pub fn maybe_switch(&self, command: &str) -> bool {
        self.maybe_switch_at(command, Instant::now())
    }

    /// 同 maybe_switch，时间由调用方给出
    pub fn maybe_switch_at(&self, command: &str, now: Instant) -> bool {
        if !self.auto_switch() {
            return false;
        }
        if self.cooling_down(&self.routing(), now) {
            return false;
        }

        let category = TaskClassifier::classify(command);
        let best = self.select_best_index(category);

        let mut state = self.routing();
        // 选择期间其他会话可能已经切换
        if self.cooling_down(&state, now) || state.current == best {
            return false;
        }
        let from = state.current;
        state.current = best;
        state.last_switch = Some(now);
        drop(state);

        tracing::info!(
            from = %self.backends[from].name,
            to = %self.backends[best].name,
            %category,
            "auto-switched backend"
        );
        true
    }

    /// 手动切换：不受冷却与分类影响，目标必须存在且已启用
    pub fn set_backend(&self, name: &str) -> Result<(), DaemonError> {
        self.set_backend_at(name, Instant::now())
    }

    pub fn set_backend_at(&self, name: &str, now: Instant) -> Result<(), DaemonError> {
        let idx = self
            .backends
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| DaemonError::BackendNotFound(name.to_string()))?;
        if !self.backends[idx].enabled {
            return Err(DaemonError::BackendDisabled(name.to_string()));
        }
        let mut state = self.routing();
        state.current = idx;
        state.last_switch = Some(now);
        drop(state);
        tracing::info!(backend = %name, "backend switched manually");
        Ok(())
    }

    /// 记录一次调用结果，返回基础分是否被重算
    pub fn record_outcome(&self, name: &str, success: bool, response_time_secs: f64) -> bool {
        let Some(idx) = self.backends.iter().position(|b| b.name == name) else {
            tracing::warn!(backend = %name, "outcome for unknown backend ignored");
            return false;
        };
        let mut stats = self.write_stats();
        let entry = &mut stats[idx];
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        let total = entry.total();
        entry.avg_response_time =
            (entry.avg_response_time * (total - 1) as f64 + response_time_secs.max(0.0)) / total as f64;

        if total < SCORE_STABILIZATION_THRESHOLD {
            return false;
        }
        let speed = (1.0 - entry.avg_response_time / 30.0).clamp(0.0, 1.0);
        entry.base_score = entry.success_rate() * 0.8 + speed * 0.2;
        entry.recomputations += 1;
        tracing::debug!(
            backend = %name,
            base_score = entry.base_score,
            success_rate = entry.success_rate(),
            "backend score recomputed"
        );
        true
    }

    pub fn stats(&self, name: &str) -> Option<BackendStats> {
        let idx = self.backends.iter().position(|b| b.name == name)?;
        Some(self.read_stats()[idx].clone())
    }

    /// 全部后端快照（注册表顺序）
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let current = self.routing().current;
        let stats = self.read_stats();
        self.backends
            .iter()
            .zip(stats.iter())
            .enumerate()
            .map(|(idx, (config, stats))| BackendSnapshot {
                config: config.clone(),
                stats: stats.clone(),
                success_rate: stats.success_rate(),
                current: idx == current,
            })
            .collect()
    }

    /// 将统计写入注册表文件；失败只记日志
    pub fn persist(&self) {
        let Some(registry) = &self.registry else {
            return;
        };
        let result = registry.save_with(|| {
            let stats = self.read_stats();
            self.backends
                .iter()
                .zip(stats.iter())
                .map(|(config, stats)| RegistryRecord::from_parts(config, stats))
                .collect()
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist backend registry");
        }
    }
}

fn first_enabled(backends: &[BackendConfig]) -> usize {
    backends.iter().position(|b| b.enabled).unwrap_or(0)
}
