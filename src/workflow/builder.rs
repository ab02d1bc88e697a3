//! 工作流构建器
//!
//! 提供流畅的API来构建工作流；构建时完成依赖校验与拓扑排序

use std::collections::HashMap;

use chrono::Utc;

use crate::planner::StepSpec;
use crate::tasks::{TaskId, TaskStatus};
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::types::*;

/// 工作流构建器
pub struct WorkflowBuilder {
    id: WorkflowId,
    name: String,
    session_id: Option<String>,
    parent_task: Option<TaskId>,
    steps: Vec<StepSpec>,
}

impl WorkflowBuilder {
    /// 创建新的工作流构建器
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("wf_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            session_id: None,
            parent_task: None,
            steps: Vec::new(),
        }
    }

    /// 设置会话ID
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// 关联父任务
    pub fn parent_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.parent_task = Some(task_id.into());
        self
    }

    /// 添加无依赖步骤
    pub fn step(mut self, id: impl Into<StepId>, description: impl Into<String>) -> Self {
        self.steps.push(StepSpec::new(id, description));
        self
    }

    /// 添加依赖其它步骤的步骤
    pub fn step_after(
        mut self,
        id: impl Into<StepId>,
        description: impl Into<String>,
        deps: &[&str],
    ) -> Self {
        let mut spec = StepSpec::new(id, description);
        spec.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self.steps.push(spec);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = StepSpec>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// 构建工作流
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(
                "workflow needs at least one step".to_string(),
            ));
        }

        let graph = WorkflowGraph::new(&self.steps)?;
        let order = graph.topological_order()?;
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut steps: Vec<Step> = self
            .steps
            .into_iter()
            .map(|spec| Step {
                sequence: position.get(spec.id.as_str()).copied().unwrap_or(usize::MAX),
                name: if spec.name.is_empty() {
                    spec.id.clone()
                } else {
                    spec.name
                },
                id: spec.id,
                description: spec.description,
                depends_on: spec.depends_on,
                status: TaskStatus::Pending,
                output: None,
                error: None,
                task_id: None,
            })
            .collect();
        steps.sort_by_key(|s| s.sequence);

        Ok(Workflow {
            id: self.id,
            name: self.name,
            session_id: self.session_id,
            parent_task: self.parent_task,
            steps,
            paused: false,
            created_at: Utc::now(),
            completed_at: None,
        })
    }
}
