//! Worker 抽象：执行一个工作单元，并对中断消息给出自己的处理策略

use async_trait::async_trait;

use crate::worker::{InterruptDecision, WorkerContext, WorkerError, WorkerOutput, WorkerTask};

#[async_trait]
pub trait Worker: Send + Sync {
    /// 执行工作单元；应在每次调用推理后端前后调用 `ctx.checkpoint()`
    async fn execute(
        &self,
        task: WorkerTask,
        ctx: WorkerContext,
    ) -> Result<WorkerOutput, WorkerError>;

    /// 对运行中收到的用户消息做出决定；默认把消息并入描述后重新规划
    fn on_interrupt(&self, task: &WorkerTask, message: &str) -> InterruptDecision {
        InterruptDecision::Modify(format!(
            "{}\n\nUpdate from user: {}",
            task.description,
            message.trim()
        ))
    }
}
