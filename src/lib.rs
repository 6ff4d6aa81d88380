//! aios - 自然语言命令解释守护进程
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + `AIOS__` 环境变量）
//! - **context**: 调用方上下文（用户、主机、工作目录、最近命令）
//! - **core**: 错误类型、优雅关闭、守护进程共享状态
//! - **gateway**: Unix socket 本地 RPC、会话表、请求分发、内核通道
//! - **llm**: 解释后端抽象（Ollama / Mock）、任务分类与模型路由
//! - **memory**: 反馈学习存储与 JSON 持久化
//! - **observability**: 日志初始化
//! - **safety**: 危险命令过滤
//! - **tools**: 受限的 shell 执行器

pub mod config;
pub mod context;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod safety;
pub mod tools;
