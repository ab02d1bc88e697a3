//! 任务数据模型与状态机
//!
//! PENDING → PLANNED → ASSIGNED → RUNNING → {COMPLETED | FAILED | CANCELLED}；
//! FAILED 在 retry_count < max_retries 时可回到 ASSIGNED，其余终态不可变。
//! 任何非终态都可以直接进入 CANCELLED（排队中的任务也能被取消）。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::TokenCount;

pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planned,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 状态机的边（不含 FAILED → ASSIGNED 的重试预算检查）
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Planned) | (Planned, Assigned) | (Assigned, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Failed, Assigned) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planned => "planned",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务类型（封闭集合；无法识别的统一归为 Other）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CodeGeneration,
    Review,
    Debugging,
    Testing,
    Analysis,
    Other,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::CodeGeneration,
        TaskType::Review,
        TaskType::Debugging,
        TaskType::Testing,
        TaskType::Analysis,
        TaskType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::Review => "review",
            Self::Debugging => "debugging",
            Self::Testing => "testing",
            Self::Analysis => "analysis",
            Self::Other => "other",
        }
    }

    /// 宽松解析：大小写、连字符、空格与常见别名都接受，未知值映射为 Other
    pub fn parse_lossy(raw: &str) -> TaskType {
        let norm = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "code_generation" | "codegen" | "code" | "coding" | "implementation" => {
                Self::CodeGeneration
            }
            "review" | "code_review" => Self::Review,
            "debugging" | "debug" | "bugfix" | "fix" => Self::Debugging,
            "testing" | "test" | "tests" => Self::Testing,
            "analysis" | "analyze" | "research" => Self::Analysis,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务优先级（排队出队顺序的主键）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// 任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// 父任务（子任务树），仅存 ID
    pub parent_id: Option<TaskId>,
    pub session_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub description: String,
    /// 进度 [0, 1]，RUNNING 期间单调不减
    pub progress: f32,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 执行该任务时要求加载的技能
    pub skills: Vec<String>,
    /// 各次尝试累计的 token 用量
    #[serde(default)]
    pub token_usage: TokenCount,
    /// 各次尝试累计的执行时长（毫秒）
    #[serde(default)]
    pub execution_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 当且仅当处于终态时有值
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        session_id: impl Into<String>,
        task_type: TaskType,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            parent_id: None,
            session_id: session_id.into(),
            task_type,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            description: description.into(),
            progress: 0.0,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 0,
            skills: Vec::new(),
            token_usage: TokenCount::default(),
            execution_ms: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<TaskId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn retry_budget_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid task transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Unknown parent task: {0}")]
    UnknownParent(TaskId),

    #[error("Parent chain of {0} contains a cycle")]
    CyclicParent(TaskId),

    #[error("Retry budget exhausted for {0}")]
    RetryBudgetExhausted(TaskId),

    #[error("Task id already exists: {0}")]
    Duplicate(TaskId),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Planned,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    #[test]
    fn test_completed_only_reachable_from_running() {
        for from in ALL_STATUSES {
            let allowed = from.can_transition_to(TaskStatus::Completed);
            assert_eq!(allowed, from == TaskStatus::Running, "from {from}");
        }
    }

    #[test]
    fn test_terminal_states_are_final_except_failed_retry() {
        for from in [TaskStatus::Completed, TaskStatus::Cancelled] {
            for to in ALL_STATUSES {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        let failed_targets: Vec<_> = ALL_STATUSES
            .into_iter()
            .filter(|to| TaskStatus::Failed.can_transition_to(*to))
            .collect();
        assert_eq!(failed_targets, vec![TaskStatus::Assigned]);
    }

    #[test]
    fn test_forward_edges_cannot_be_skipped() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Planned.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Assigned));
    }

    #[test]
    fn test_task_type_parse_lossy() {
        assert_eq!(TaskType::parse_lossy("Code-Generation"), TaskType::CodeGeneration);
        assert_eq!(TaskType::parse_lossy("debug"), TaskType::Debugging);
        assert_eq!(TaskType::parse_lossy("poetry"), TaskType::Other);
        for t in TaskType::ALL {
            assert_eq!(TaskType::parse_lossy(t.as_str()), t);
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::Low < TaskPriority::Normal);
    }
}
