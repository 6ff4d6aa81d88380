//! 工具箱：命令执行

pub mod shell;

pub use shell::{CommandRunner, ExecutionResult};
