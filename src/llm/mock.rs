//! 离线后端：Mock（回显）与 Scripted（按脚本依次返回，供测试注入）

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{Completion, CompletionOptions, LlmClient, LlmError, TokenCount};
use crate::memory::{Message, Role};

/// Mock 客户端：回显最后一条 User 消息（无 API Key 时使用）
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}

/// 脚本化客户端：按顺序弹出预设结果；脚本耗尽后返回 fallback
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Result<String, LlmError>,
    delay: Option<Duration>,
    /// 每次成功调用报告的用量
    usage_per_call: Option<TokenCount>,
    spent: Mutex<TokenCount>,
    calls: AtomicUsize,
    /// 每次调用收到的消息（用于断言 prompt 内容）
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Err(LlmError::Unavailable("script exhausted".to_string())),
            delay: None,
            usage_per_call: None,
            spent: Mutex::new(TokenCount::default()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 永远返回同一结果
    pub fn always(result: Result<String, LlmError>) -> Self {
        Self::new(Vec::new()).with_fallback(result)
    }

    pub fn with_fallback(mut self, fallback: Result<String, LlmError>) -> Self {
        self.fallback = fallback;
        self
    }

    /// 每次调用前先等待 delay（模拟慢后端）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, usage: TokenCount) -> Self {
        self.usage_per_call = Some(usage);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        self.complete_with_usage(messages, options)
            .await
            .map(|c| c.text)
    }

    async fn complete_with_usage(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        let text = next.unwrap_or_else(|| self.fallback.clone())?;
        if let (Some(usage), Ok(mut spent)) = (self.usage_per_call, self.spent.lock()) {
            *spent += usage;
        }
        Ok(Completion {
            text,
            usage: self.usage_per_call,
        })
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.spent
            .lock()
            .map(|s| (s.prompt, s.completion, s.total))
            .unwrap_or_default()
    }
}
