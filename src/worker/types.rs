//! Worker 运行时类型：生命周期状态、工作单元、输出与上报事件

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::TokenCount;
use crate::tasks::{Task, TaskError, TaskId, TaskType};

pub type WorkerId = String;

/// Worker 生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Running,
    Interrupted,
    Cancelling,
    Terminated,
}

impl WorkerState {
    /// 计入并发上限的状态
    pub fn is_active(self) -> bool {
        matches!(self, Self::Spawning | Self::Running | Self::Interrupted)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Cancelling => "cancelling",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// 交给单个 worker 的工作单元；每次（重新）派发都会新建一个
#[derive(Debug, Clone, Serialize)]
pub struct WorkerTask {
    pub id: String,
    pub task_id: TaskId,
    pub session_id: String,
    pub task_type: TaskType,
    pub description: String,
    pub skills: Vec<String>,
    /// 第几次尝试（= 派发时的 retry_count）
    pub attempt: u32,
    pub worker_id: WorkerId,
    /// 墙钟截止时间
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
}

impl WorkerTask {
    pub fn from_task(task: &Task, worker_id: impl Into<WorkerId>, timeout: Duration) -> Self {
        Self {
            id: format!("wt_{}", uuid::Uuid::new_v4()),
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            task_type: task.task_type,
            description: task.description.clone(),
            skills: task.skills.clone(),
            attempt: task.retry_count,
            worker_id: worker_id.into(),
            timeout,
            created_at: Utc::now(),
        }
    }
}

/// worker 成功时的产出
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerOutput {
    pub result: String,
    /// 本次执行自身消耗的 token；后端未报告时为 None
    pub token_usage: Option<TokenCount>,
}

impl WorkerOutput {
    pub fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            token_usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenCount) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

/// worker 对中断消息的处理策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptDecision {
    /// 不改变状态，消息在下一个检查点交给 worker
    Continue,
    /// 以修订后的描述重新规划
    Modify(String),
    /// 立即取消
    Cancel,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Worker execution failed: {0}")]
    Execution(String),

    #[error("Worker timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker cancelled")]
    Cancelled,

    #[error("Worker not found: {0}")]
    NotFound(WorkerId),

    #[error("Task {0} already has an active worker")]
    AlreadyActive(TaskId),

    #[error("Worker manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// 一次执行的结局
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Succeeded(WorkerOutput),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn token_usage(&self) -> Option<TokenCount> {
        match self {
            Self::Succeeded(output) => output.token_usage,
            _ => None,
        }
    }

    /// 失败摘要（成功时为 None）
    pub fn error_summary(&self) -> Option<String> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(e) => Some(e.clone()),
            Self::TimedOut => Some("worker deadline exceeded".to_string()),
            Self::Cancelled => Some("cancelled".to_string()),
        }
    }
}

/// 结束上报
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    pub worker_task_id: String,
    pub task_id: TaskId,
    pub session_id: String,
    pub attempt: u32,
    pub outcome: WorkerOutcome,
    /// 结果到达时任务已是终态（被取消），结果已丢弃
    pub discarded: bool,
    pub elapsed: Duration,
}

/// 按任务有序的 worker 事件流；排队与改写事件在准入锁内发出，先于同一任务后续的 Started
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Queued {
        task_id: TaskId,
        session_id: String,
        position: usize,
    },
    /// 任务描述被改写，原 worker（若有）被取代
    Replaced {
        task_id: TaskId,
        session_id: String,
    },
    Started {
        worker_id: WorkerId,
        task_id: TaskId,
        session_id: String,
        attempt: u32,
    },
    Progress {
        worker_id: WorkerId,
        task_id: TaskId,
        session_id: String,
        progress: f32,
    },
    Finished(WorkerReport),
}
