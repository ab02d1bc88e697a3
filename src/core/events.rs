//! 编排事件流：任务与会话生命周期通知（可序列化为 JSON 供各传输层展示）
//!
//! 单个任务的事件按发出顺序送达（created → started → progress → completed）；不同任务之间不保证顺序。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::llm::TokenCount;
use crate::tasks::{TaskId, TaskType};
use crate::workflow::{WorkflowId, WorkflowStatus};

/// 事件内容
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    TaskCreated {
        task_id: TaskId,
        session_id: String,
        task_type: TaskType,
        description: String,
        parent_id: Option<TaskId>,
    },
    /// 池已满，任务排队
    TaskQueued {
        task_id: TaskId,
        session_id: String,
        position: usize,
    },
    TaskStarted {
        task_id: TaskId,
        session_id: String,
        worker_id: String,
        attempt: u32,
    },
    TaskProgress {
        task_id: TaskId,
        session_id: String,
        progress: f32,
    },
    /// 纠正：原 worker 被取代
    TaskCorrected {
        task_id: TaskId,
        session_id: String,
    },
    TaskRetrying {
        task_id: TaskId,
        session_id: String,
        attempt: u32,
        reason: String,
    },
    TaskCompleted {
        task_id: TaskId,
        session_id: String,
        result: String,
        /// 所有尝试（工作流父任务为所有子任务）累计的用量
        token_usage: TokenCount,
        execution_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        session_id: String,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
        session_id: String,
    },
    DelegatedExternal {
        session_id: String,
        agent: String,
        description: String,
    },
    WorkflowCreated {
        workflow_id: WorkflowId,
        session_id: String,
        parent_task: TaskId,
        steps: Vec<String>,
    },
    WorkflowFinished {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    },
    SessionOpened {
        session_id: String,
    },
    SessionExpired {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
    },
}

/// 带时间戳的事件：`{"timestamp": ..., "type": ..., "payload": {...}}`
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl OrchestratorEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// 事件总线：broadcast，订阅者落后过多时丢弃旧事件
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, payload: EventPayload) {
        // 无订阅者时发送失败，属正常情况
        let _ = self.tx.send(OrchestratorEvent::new(payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}
