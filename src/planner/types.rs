//! 规划数据：分类结果、触发器、系统负载与执行决策（均为瞬时值，不持久化）

use serde::{Deserialize, Serialize};

use crate::tasks::{TaskId, TaskStatus, TaskType};

/// 分类器给出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Reply,
    Delegate,
    MultiStep,
    Complete,
}

impl PlanAction {
    /// 宽松解析；无法识别时视为 reply
    pub fn parse_lossy(raw: &str) -> PlanAction {
        match raw.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "delegate" | "spawn" | "worker" => Self::Delegate,
            "multi_step" | "multistep" | "plan" | "workflow" => Self::MultiStep,
            "complete" | "done" | "status" => Self::Complete,
            _ => Self::Reply,
        }
    }

    pub fn is_delegation(self) -> bool {
        matches!(self, Self::Delegate | Self::MultiStep)
    }
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningResult {
    pub action: PlanAction,
    pub task_type: TaskType,
    pub subagent_type: Option<String>,
    pub skills: Vec<String>,
    pub estimated_steps: u32,
    /// [0, 1]
    pub confidence: f32,
    pub justification: String,
    /// 消息是对某个活跃任务的纠正
    #[serde(default)]
    pub correction: bool,
    /// 消息要求取消活跃任务
    #[serde(default)]
    pub cancellation: bool,
    /// 纠正 / 取消所指向的任务；None 时取会话中最近的活跃任务
    #[serde(default)]
    pub target_task: Option<TaskId>,
    /// 后端不可用时的降级结果
    #[serde(default)]
    pub degraded: bool,
}

impl PlanningResult {
    pub fn reply(justification: impl Into<String>) -> Self {
        Self {
            action: PlanAction::Reply,
            task_type: TaskType::Other,
            subagent_type: None,
            skills: Vec::new(),
            estimated_steps: 1,
            confidence: 1.0,
            justification: justification.into(),
            correction: false,
            cancellation: false,
            target_task: None,
            degraded: false,
        }
    }

    /// 降级结果：reply、confidence = 0
    pub fn degraded(reason: impl std::fmt::Display) -> Self {
        Self {
            confidence: 0.0,
            degraded: true,
            justification: format!("degraded mode: {}", reason),
            ..Self::reply("")
        }
    }

    pub fn delegate(task_type: TaskType, confidence: f32) -> Self {
        Self {
            action: PlanAction::Delegate,
            task_type,
            confidence: confidence.clamp(0.0, 1.0),
            ..Self::reply("")
        }
    }

    pub fn with_action(mut self, action: PlanAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.estimated_steps = steps;
        self
    }

    pub fn with_subagent(mut self, subagent_type: impl Into<String>) -> Self {
        self.subagent_type = Some(subagent_type.into());
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// 触发决策的事件
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// 新消息；active_task 为会话中最近的活跃任务
    NewMessage { active_task: Option<TaskId> },
    /// 针对某任务的纠正
    Correction {
        task_id: TaskId,
        worker_running: bool,
        amended_description: String,
    },
    /// 取消；task_id 为 None 表示没有可取消的目标
    Cancellation {
        task_id: Option<TaskId>,
        task_active: bool,
    },
    /// worker 上报结果
    WorkerResult {
        task_id: TaskId,
        success: bool,
        retry_count: u32,
        max_retries: u32,
        /// 任务在结果到达前已被取消
        task_cancelled: bool,
    },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::Correction { .. } => "correction",
            Self::Cancellation { .. } => "cancellation",
            Self::WorkerResult { .. } => "worker_result",
        }
    }
}

/// 决策时刻采样的负载（瞬时值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SystemLoad {
    pub active_workers: usize,
    pub max_concurrent: usize,
    pub queued: usize,
}

impl SystemLoad {
    pub fn saturated(&self) -> bool {
        self.active_workers >= self.max_concurrent
    }
}

/// 执行决策动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Reply,
    SpawnWorker,
    AwaitResult,
    CompleteTask,
    RequestInfo,
    DelegateExternal,
}

/// 执行决策
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionDecision {
    pub action: DecisionAction,
    pub message: Option<String>,
    pub target_task: Option<TaskId>,
    /// complete_task 的目标状态
    pub task_status: Option<TaskStatus>,
    /// 池已满，新任务将以 PENDING 排队
    pub queued: bool,
    /// worker 失败后的重新派发
    pub retry: bool,
    /// 需要先拆解为多步工作流
    pub multi_step: bool,
}

impl ExecutionDecision {
    pub fn new(action: DecisionAction) -> Self {
        Self {
            action,
            message: None,
            target_task: None,
            task_status: None,
            queued: false,
            retry: false,
            multi_step: false,
        }
    }

    pub fn reply(message: impl Into<String>) -> Self {
        Self::new(DecisionAction::Reply).with_message(message)
    }

    pub fn complete(task_id: impl Into<TaskId>, status: TaskStatus) -> Self {
        let mut d = Self::new(DecisionAction::CompleteTask).with_target(task_id);
        d.task_status = Some(status);
        d
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_target(mut self, task_id: impl Into<TaskId>) -> Self {
        self.target_task = Some(task_id.into());
        self
    }
}
