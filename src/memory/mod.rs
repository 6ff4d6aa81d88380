//! 记忆层：学习日志（反馈存储）与 JSON 持久化

pub mod feedback;
pub mod persistence;

pub use feedback::{FeedbackEntry, FeedbackStore};
pub use persistence::JsonFile;
