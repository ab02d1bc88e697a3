//! 推理后端抽象
//!
//! 编排核心只依赖一个窄接口：complete(messages, options) -> text。
//! 所有后端（OpenAI 兼容 / Mock / Scripted）实现 LlmClient；失败统一归为 Unavailable / Timeout 两类，
//! 调用方必须把两者都当作可恢复错误并走各自的降级分支。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;

/// 推理后端错误（均可恢复）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend timeout")]
    Timeout,
}

/// 单次补全的参数
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// 单次调用的墙钟超时；None 表示由调用方的外层截止时间控制
    pub timeout: Option<Duration>,
}

impl CompletionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 一次或多次调用的 token 计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenCount {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

impl std::ops::Add for TokenCount {
    type Output = TokenCount;

    fn add(self, other: TokenCount) -> TokenCount {
        TokenCount {
            prompt: self.prompt + other.prompt,
            completion: self.completion + other.completion,
            total: self.total + other.total,
        }
    }
}

impl std::ops::AddAssign for TokenCount {
    fn add_assign(&mut self, other: TokenCount) {
        *self = *self + other;
    }
}

impl std::iter::Sum for TokenCount {
    fn sum<I: Iterator<Item = TokenCount>>(iter: I) -> TokenCount {
        iter.fold(TokenCount::default(), |acc, c| acc + c)
    }
}

/// 补全文本及本次调用自身的 token 用量
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// 后端未报告用量时为 None
    pub usage: Option<TokenCount>,
}

/// 推理后端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式补全
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;

    /// 补全并返回本次调用的用量；并发调用之间互不串扰。默认不报告用量
    async fn complete_with_usage(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let text = self.complete(messages, options).await?;
        Ok(Completion { text, usage: None })
    }

    /// 累计 token 使用：(prompt, completion, total)；默认 (0, 0, 0)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 带超时的补全：options.timeout 到期即返回 LlmError::Timeout，未完成的请求随 future 一起丢弃
pub async fn complete_with_timeout(
    llm: &dyn LlmClient,
    messages: &[Message],
    options: &CompletionOptions,
) -> Result<String, LlmError> {
    match options.timeout {
        Some(limit) => tokio::time::timeout(limit, llm.complete(messages, options))
            .await
            .unwrap_or(Err(LlmError::Timeout)),
        None => llm.complete(messages, options).await,
    }
}

/// `complete_with_timeout` 的计量版本
pub async fn complete_with_usage_timeout(
    llm: &dyn LlmClient,
    messages: &[Message],
    options: &CompletionOptions,
) -> Result<Completion, LlmError> {
    match options.timeout {
        Some(limit) => tokio::time::timeout(limit, llm.complete_with_usage(messages, options))
            .await
            .unwrap_or(Err(LlmError::Timeout)),
        None => llm.complete_with_usage(messages, options).await,
    }
}
