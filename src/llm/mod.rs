//! LLM 层：解释后端抽象、Ollama 客户端、Mock、多模型路由与注册表

pub mod mock;
pub mod ollama;
pub mod registry;
pub mod router;
pub mod traits;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;
pub use registry::{build_entries, BackendRegistry, RegistryRecord};
pub use router::{
    BackendConfig, BackendSnapshot, BackendStats, ModelRouter, RouterSettings, TaskCategory,
    TaskClassifier, MAX_BACKENDS,
};
pub use traits::{
    InterpretBackend, InterpretOutcome, RetryConfig, RetryingBackend, UNCLEAR_MARKER,
    UNSAFE_MARKER,
};
