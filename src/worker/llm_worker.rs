//! 基于推理后端的默认 worker
//!
//! 流程：检查点 → 组装上下文 → 检查点（并入中断消息）→ 调用后端 → 检查点。
//! 后端调用与取消信号 select，取消后不再等待在途请求。

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{ContextAssembler, ContextRequest};
use crate::llm::{complete_with_usage_timeout, CompletionOptions, LlmClient};
use crate::memory::Message;
use crate::worker::{Worker, WorkerContext, WorkerError, WorkerOutput, WorkerTask};

pub struct LlmWorker {
    assembler: Arc<ContextAssembler>,
    llm: Arc<dyn LlmClient>,
    options: CompletionOptions,
}

impl LlmWorker {
    pub fn new(assembler: Arc<ContextAssembler>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            assembler,
            llm,
            options: CompletionOptions::new(),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Worker for LlmWorker {
    async fn execute(
        &self,
        task: WorkerTask,
        mut ctx: WorkerContext,
    ) -> Result<WorkerOutput, WorkerError> {
        ctx.checkpoint().await?;
        ctx.report_progress(0.1);

        let request = ContextRequest::new(task.session_id.clone())
            .with_task_type(task.task_type)
            .with_skills(task.skills.clone())
            .with_task(task.task_id.clone());
        let (system_prompt, stats) = self.assembler.build_with(&request).await;
        tracing::debug!(
            "Worker {} context: {} tokens, {} memory entries",
            task.worker_id,
            stats.compressed_length,
            stats.memory_entries
        );

        let notes = ctx.checkpoint().await?;
        ctx.report_progress(0.3);

        let mut user = task.description.clone();
        for note in &notes {
            user.push_str("\n\nUpdate from user: ");
            user.push_str(note);
        }
        let messages = vec![Message::system(system_prompt), Message::user(user)];

        let result = tokio::select! {
            res = complete_with_usage_timeout(self.llm.as_ref(), &messages, &self.options) => res,
            _ = ctx.cancelled() => return Err(WorkerError::Cancelled),
        };
        let completion = result.map_err(|e| WorkerError::Execution(e.to_string()))?;

        ctx.checkpoint().await?;
        ctx.report_progress(0.9);

        Ok(WorkerOutput {
            result: completion.text,
            token_usage: completion.usage,
        })
    }
}
