//! 推理后端层：客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）

pub mod factory;
pub mod mock;
pub mod openai;
pub mod traits;

pub use factory::create_llm_from_config;
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{
    complete_with_timeout, complete_with_usage_timeout, Completion, CompletionOptions, LlmClient,
    LlmError, TokenCount,
};
