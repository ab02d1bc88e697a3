//! 工作流类型定义
//!
//! 工作流是按依赖排好序的一组步骤；步骤状态复用任务状态机，工作流状态由步骤推导。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::{TaskId, TaskStatus};

pub type WorkflowId = String;
pub type StepId = String;

/// 工作流状态（推导得出，不单独设置）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// 已创建，尚无步骤被激活
    Planning,
    /// 执行中
    Active,
    /// 已暂停：不再激活新步骤，已运行的步骤不受影响
    Paused,
    /// 所有步骤完成
    Completed,
    /// 有步骤失败（或被取消）且不再重试
    Failed,
}

impl WorkflowStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 工作流中的一个步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub description: String,
    pub depends_on: Vec<StepId>,
    pub status: TaskStatus,
    /// 拓扑序中的位置
    pub sequence: usize,
    pub output: Option<String>,
    pub error: Option<String>,
    /// 执行该步骤的子任务
    pub task_id: Option<TaskId>,
}

/// 工作流
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub session_id: Option<String>,
    /// 由该工作流承载的父任务
    pub parent_task: Option<TaskId>,
    /// 按 sequence 排列
    pub steps: Vec<Step>,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub(crate) fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// 由步骤状态推导
    pub fn status(&self) -> WorkflowStatus {
        if self.steps.iter().all(|s| s.status == TaskStatus::Completed) {
            return WorkflowStatus::Completed;
        }
        if self
            .steps
            .iter()
            .any(|s| matches!(s.status, TaskStatus::Failed | TaskStatus::Cancelled))
        {
            return WorkflowStatus::Failed;
        }
        if self.paused {
            return WorkflowStatus::Paused;
        }
        if self.steps.iter().all(|s| s.status == TaskStatus::Pending) {
            WorkflowStatus::Planning
        } else {
            WorkflowStatus::Active
        }
    }

    /// 依赖全部完成、自身仍在等待的步骤（按 sequence）
    pub fn ready_steps(&self) -> Vec<&Step> {
        if self.paused || self.status().is_finished() {
            return Vec::new();
        }
        self.steps
            .iter()
            .filter(|s| s.status == TaskStatus::Pending && self.unmet_dependencies(s).is_empty())
            .collect()
    }

    pub(crate) fn unmet_dependencies(&self, step: &Step) -> Vec<StepId> {
        step.depends_on
            .iter()
            .filter(|dep| self.step(dep).map(|d| d.status) != Some(TaskStatus::Completed))
            .cloned()
            .collect()
    }

    /// 已完成步骤的输出，按 sequence 拼接
    pub fn combined_output(&self) -> String {
        self.steps
            .iter()
            .filter_map(|s| s.output.as_deref().map(|o| format!("## {}\n{}", s.name, o)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// 工作流错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Cyclic dependency detected among steps: {0:?}")]
    CyclicDependency(Vec<StepId>),

    #[error("Step {step} cannot start, unfinished dependencies: {missing:?}")]
    DependenciesNotMet { step: StepId, missing: Vec<StepId> },

    #[error("Invalid step transition for {step}: {from} -> {to}")]
    InvalidTransition {
        step: StepId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Workflow {0} is paused")]
    Paused(WorkflowId),

    #[error("Invalid workflow configuration: {0}")]
    InvalidConfiguration(String),
}
