//! 编排层错误与对外状态码
//!
//! 各子系统的错误经 `#[from]` 汇总到 OrchestratorError；对调用方只暴露
//! 机器可读的 status_code 与自然语言的 user_message，不抛出原始错误。

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::MemoryError;
use crate::planner::{ClassificationError, DecisionError};
use crate::tasks::TaskError;
use crate::worker::WorkerError;
use crate::workflow::WorkflowError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Decision(#[from] DecisionError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Backend(#[from] LlmError),

    /// 池已满：以排队响应告知调用方，不是失败
    #[error("Worker pool saturated, queued at position {position}")]
    ResourceExhausted { position: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is paused")]
    SessionPaused(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    /// 机器可读状态码
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::Classification(_) => "classification_error",
            Self::Decision(_) => "decision_error",
            Self::Worker(WorkerError::Timeout(_)) => "worker_timeout",
            Self::Worker(_) => "worker_error",
            Self::Workflow(_) => "workflow_error",
            Self::Task(_) => "task_error",
            Self::Memory(_) => "memory_error",
            Self::Backend(_) => "backend_unavailable",
            Self::ResourceExhausted { .. } => "queued",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionPaused(_) => "session_paused",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// 面向用户的说明
    pub fn user_message(&self) -> String {
        match self {
            Self::Workflow(e) => format!("The plan could not be applied: {}.", e),
            Self::Worker(e) => format!("The task could not be completed: {}.", e),
            Self::Task(e) => format!("That task cannot be changed: {}.", e),
            Self::ResourceExhausted { position } => format!(
                "All workers are busy; your task is queued at position {}.",
                position
            ),
            Self::SessionPaused(_) => {
                "This session is paused. Resume it to continue.".to_string()
            }
            Self::SessionNotFound(id) => format!("Session {} does not exist.", id),
            Self::ShuttingDown => "The service is shutting down.".to_string(),
            Self::Classification(_) | Self::Backend(_) => {
                "I couldn't reach the reasoning service, please try again shortly.".to_string()
            }
            Self::Decision(_) | Self::Memory(_) => {
                "Something went wrong while handling your message.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_codes_and_messages() {
        let err: OrchestratorError = WorkflowError::StepNotFound("b".into()).into();
        assert_eq!(err.status_code(), "workflow_error");
        assert!(err.user_message().contains("Step not found: b"));

        let err: OrchestratorError = WorkerError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(err.status_code(), "worker_timeout");

        let err = OrchestratorError::ResourceExhausted { position: 2 };
        assert_eq!(err.status_code(), "queued");
        assert!(err.user_message().contains("position 2"));
    }
}
