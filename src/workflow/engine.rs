//! 工作流引擎
//!
//! 保存工作流并执行步骤状态迁移。步骤进入 RUNNING 前必须所有依赖 COMPLETED；
//! 暂停只冻结新步骤的激活，不影响已在运行的步骤。非法操作在调用时拒绝，不会被悄悄应用。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use crate::planner::StepSpec;
use crate::tasks::{TaskId, TaskStatus};
use crate::workflow::builder::WorkflowBuilder;
use crate::workflow::types::*;

/// 步骤在开始运行前的推进链
fn pre_run_rank(status: TaskStatus) -> Option<u8> {
    match status {
        TaskStatus::Pending => Some(0),
        TaskStatus::Planned => Some(1),
        TaskStatus::Assigned => Some(2),
        TaskStatus::Running => Some(3),
        _ => None,
    }
}

/// 步骤迁移规则：任务状态机的边，外加在开始运行前向前跳过中间状态
fn step_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    if from.can_transition_to(to) {
        return true;
    }
    matches!((pre_run_rank(from), pre_run_rank(to)), (Some(a), Some(b)) if b > a)
}

#[derive(Default)]
struct EngineState {
    workflows: HashMap<WorkflowId, Workflow>,
    /// 子任务 -> (工作流, 步骤)
    by_task: HashMap<TaskId, (WorkflowId, StepId)>,
}

/// 工作流引擎
#[derive(Default)]
pub struct WorkflowEngine {
    state: RwLock<EngineState>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建工作流；依赖环、未知依赖、重复 ID 在这里被拒绝
    pub fn create(&self, name: &str, steps: Vec<StepSpec>) -> Result<WorkflowId, WorkflowError> {
        let workflow = WorkflowBuilder::new(name).steps(steps).build()?;
        Ok(self.insert(workflow))
    }

    /// 登记已构建的工作流
    pub fn insert(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id.clone();
        tracing::info!(
            "Workflow {} ({}) created with {} steps",
            id,
            workflow.name,
            workflow.steps.len()
        );
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for step in &workflow.steps {
            if let Some(task_id) = &step.task_id {
                state
                    .by_task
                    .insert(task_id.clone(), (id.clone(), step.id.clone()));
            }
        }
        state.workflows.insert(id.clone(), workflow);
        id
    }

    /// 推进步骤状态，返回推导后的工作流状态
    pub fn advance(
        &self,
        workflow_id: &str,
        step_id: &str,
        new_status: TaskStatus,
    ) -> Result<WorkflowStatus, WorkflowError> {
        self.advance_with(workflow_id, step_id, new_status, None)
    }

    /// 推进步骤状态并记录产出：COMPLETED 时写入 output，FAILED / CANCELLED 时写入 error
    pub fn advance_with(
        &self,
        workflow_id: &str,
        step_id: &str,
        new_status: TaskStatus,
        detail: Option<String>,
    ) -> Result<WorkflowStatus, WorkflowError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let workflow = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;

        let (from, missing) = {
            let step = workflow
                .step(step_id)
                .ok_or_else(|| WorkflowError::StepNotFound(step_id.to_string()))?;
            (step.status, workflow.unmet_dependencies(step))
        };

        if !step_transition_allowed(from, new_status) {
            return Err(WorkflowError::InvalidTransition {
                step: step_id.to_string(),
                from,
                to: new_status,
            });
        }
        if new_status == TaskStatus::Running && from != TaskStatus::Running {
            if workflow.paused {
                return Err(WorkflowError::Paused(workflow_id.to_string()));
            }
            if !missing.is_empty() {
                return Err(WorkflowError::DependenciesNotMet {
                    step: step_id.to_string(),
                    missing,
                });
            }
        }

        if let Some(step) = workflow.step_mut(step_id) {
            step.status = new_status;
            match new_status {
                TaskStatus::Completed => step.output = detail,
                TaskStatus::Failed | TaskStatus::Cancelled => step.error = detail,
                _ => {}
            }
        }

        let status = workflow.status();
        if status.is_finished() && workflow.completed_at.is_none() {
            workflow.completed_at = Some(Utc::now());
            tracing::info!("Workflow {} finished: {:?}", workflow_id, status);
        }
        tracing::debug!("Workflow {} step {}: {} -> {}", workflow_id, step_id, from, new_status);
        Ok(status)
    }

    /// 把步骤绑定到执行它的子任务
    pub fn bind_task(
        &self,
        workflow_id: &str,
        step_id: &str,
        task_id: impl Into<TaskId>,
    ) -> Result<(), WorkflowError> {
        let task_id = task_id.into();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let step = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?
            .step_mut(step_id)
            .ok_or_else(|| WorkflowError::StepNotFound(step_id.to_string()))?;
        step.task_id = Some(task_id.clone());
        state
            .by_task
            .insert(task_id, (workflow_id.to_string(), step_id.to_string()));
        Ok(())
    }

    /// 由子任务反查所在的工作流与步骤
    pub fn find_by_task(&self, task_id: &str) -> Option<(WorkflowId, StepId)> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_task
            .get(task_id)
            .cloned()
    }

    /// 工作流快照
    pub fn get_state(&self, workflow_id: &str) -> Option<Workflow> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workflows
            .get(workflow_id)
            .cloned()
    }

    pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workflows
            .get(workflow_id)
            .map(Workflow::status)
    }

    /// 可以激活的步骤（暂停或已结束时为空）
    pub fn ready_steps(&self, workflow_id: &str) -> Result<Vec<Step>, WorkflowError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let workflow = state
            .workflows
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        Ok(workflow.ready_steps().into_iter().cloned().collect())
    }

    /// 原子地把所有就绪步骤推进到 RUNNING 并返回它们，避免并发调用方重复激活同一步骤
    pub fn activate_ready(&self, workflow_id: &str) -> Result<Vec<Step>, WorkflowError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let workflow = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        let ready: Vec<StepId> = workflow.ready_steps().iter().map(|s| s.id.clone()).collect();
        let mut activated = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(step) = workflow.step_mut(&id) {
                step.status = TaskStatus::Running;
                activated.push(step.clone());
            }
        }
        Ok(activated)
    }

    /// 承载某父任务的工作流
    pub fn workflow_for_parent(&self, task_id: &str) -> Option<WorkflowId> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workflows
            .values()
            .find(|w| w.parent_task.as_deref() == Some(task_id))
            .map(|w| w.id.clone())
    }

    /// 暂停：冻结新步骤激活
    pub fn pause(&self, workflow_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        self.set_paused(workflow_id, true)
    }

    /// 恢复激活
    pub fn resume(&self, workflow_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        self.set_paused(workflow_id, false)
    }

    fn set_paused(&self, workflow_id: &str, paused: bool) -> Result<WorkflowStatus, WorkflowError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let workflow = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        if !workflow.status().is_finished() {
            workflow.paused = paused;
        }
        Ok(workflow.status())
    }

    /// 取消所有未结束的步骤，返回其绑定的子任务
    pub fn cancel(&self, workflow_id: &str) -> Result<Vec<TaskId>, WorkflowError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let workflow = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        let mut tasks = Vec::new();
        for step in workflow.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.status = TaskStatus::Cancelled;
            tasks.extend(step.task_id.clone());
        }
        if workflow.completed_at.is_none() {
            workflow.completed_at = Some(Utc::now());
        }
        Ok(tasks)
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workflows
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
