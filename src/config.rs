//! 守护进程配置：从 config/aios.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AIOS__*` 覆盖（双下划线表示嵌套，如 `AIOS__DAEMON__MAX_SESSIONS=16`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::TaskCategory;

/// 配置根（对应 aios.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub daemon: DaemonSection,
    pub router: RouterSection,
    pub feedback: FeedbackSection,
    pub context: ContextSection,
    pub retry: RetrySection,
    /// 后端注册表；为空时使用内置的四个本地模型
    pub backends: Vec<BackendSection>,
}

/// [daemon] 段：监听 socket、会话上限、默认模型与执行模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub socket_path: PathBuf,
    pub max_sessions: usize,
    /// 启动时的当前后端
    pub default_model: String,
    /// 仅用于状态上报；安全过滤始终执行
    pub safety_mode: bool,
    /// true 时只返回解释结果，等待客户端确认
    pub confirmation_required: bool,
    pub exec_timeout_secs: u64,
    /// 命令输出截断上限（字节）
    pub max_output_bytes: usize,
    /// 单行请求最大长度（字节）
    pub max_request_bytes: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/aios.sock"),
            max_sessions: 64,
            default_model: "codellama:7b-instruct".to_string(),
            safety_mode: true,
            confirmation_required: true,
            exec_timeout_secs: 30,
            max_output_bytes: 4096,
            max_request_bytes: 64 * 1024,
        }
    }
}

/// [router] 段：自动切换、冷却时间、注册表文件、共享后端等待时间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub auto_switch: bool,
    pub switch_cooldown_secs: u64,
    pub registry_path: Option<PathBuf>,
    pub backend_wait_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            auto_switch: true,
            switch_cooldown_secs: 300,
            registry_path: Some(PathBuf::from("/var/lib/aios/models.json")),
            backend_wait_secs: 5,
        }
    }
}

/// [feedback] 段：学习日志文件与容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackSection {
    pub path: Option<PathBuf>,
    pub capacity: usize,
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("/var/lib/aios/learning.json")),
            capacity: 1000,
        }
    }
}

/// [context] 段：上下文刷新周期与历史命令容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub ttl_secs: u64,
    pub history_capacity: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            history_capacity: 50,
        }
    }
}

/// [retry] 段：后端客户端重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
        }
    }
}

/// [[backends]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub task_types: Vec<TaskCategory>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_performance_score")]
    pub performance_score: f64,
}

fn default_endpoint() -> String {
    "http://localhost:11434/api".to_string()
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.1
}

fn default_enabled() -> bool {
    true
}

fn default_performance_score() -> f64 {
    0.8
}

impl BackendSection {
    #[allow(clippy::too_many_arguments)]
    fn stock(
        name: &str,
        description: &str,
        timeout_secs: u64,
        max_tokens: u32,
        temperature: f32,
        task_types: &[TaskCategory],
        priority: u32,
        performance_score: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            endpoint: default_endpoint(),
            timeout_secs,
            max_tokens,
            temperature,
            task_types: task_types.to_vec(),
            priority,
            enabled: true,
            performance_score,
        }
    }
}

/// 内置后端：四个常见本地模型
pub fn default_backends() -> Vec<BackendSection> {
    use TaskCategory::*;
    vec![
        BackendSection::stock(
            "codellama:7b-instruct",
            "Code-focused model for development and file tasks",
            30,
            512,
            0.1,
            &[Development, File, System],
            1,
            0.85,
        ),
        BackendSection::stock(
            "phi3:mini",
            "Fast lightweight model for quick responses",
            15,
            256,
            0.2,
            &[General, File, Process],
            2,
            0.75,
        ),
        BackendSection::stock(
            "llama3.2:3b",
            "Balanced general-purpose model",
            20,
            384,
            0.15,
            &[General, Network, Data],
            3,
            0.80,
        ),
        BackendSection::stock(
            "mistral:7b-instruct",
            "High-quality model for complex and security tasks",
            45,
            1024,
            0.1,
            &[Security, Development, System],
            0,
            0.90,
        ),
    ]
}

impl AppConfig {
    /// 生效的后端列表：未配置时回落到内置列表
    pub fn effective_backends(&self) -> Vec<BackendSection> {
        if self.backends.is_empty() {
            default_backends()
        } else {
            self.backends.clone()
        }
    }
}

/// 从 config 目录加载配置，环境变量 AIOS__* 可覆盖
///
/// 1. 按顺序查找 config/aios.toml、/etc/aios/aios.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AIOS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/aios", "/etc/aios/aios"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AIOS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.daemon.max_sessions, 64);
        assert_eq!(cfg.daemon.default_model, "codellama:7b-instruct");
        assert!(cfg.daemon.safety_mode);
        assert!(cfg.daemon.confirmation_required);
        assert_eq!(cfg.router.switch_cooldown_secs, 300);
        assert_eq!(cfg.feedback.capacity, 1000);
        assert_eq!(cfg.context.history_capacity, 50);
        assert_eq!(cfg.effective_backends().len(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[daemon]
max_sessions = 8
confirmation_required = false

[router]
switch_cooldown_secs = 10

[[backends]]
name = "tiny"
task_types = ["file", "development"]
priority = 1
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.daemon.max_sessions, 8);
        assert!(!cfg.daemon.confirmation_required);
        assert_eq!(cfg.daemon.default_model, "codellama:7b-instruct");
        assert_eq!(cfg.router.switch_cooldown_secs, 10);
        assert!(cfg.router.auto_switch);

        let backends = cfg.effective_backends();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name, "tiny");
        assert_eq!(
            backends[0].task_types,
            vec![TaskCategory::File, TaskCategory::Development]
        );
        assert!(backends[0].enabled);
        assert_eq!(backends[0].timeout_secs, 30);
    }
}
