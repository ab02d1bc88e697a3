//! 工作流依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序（Kahn）；环、未知依赖、重复 ID 都在构建时拒绝

use std::collections::{HashMap, VecDeque};

use crate::planner::StepSpec;
use crate::workflow::types::{StepId, WorkflowError};

/// 工作流依赖图
pub struct WorkflowGraph {
    /// 声明顺序
    order: Vec<StepId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: HashMap<StepId, usize>,
}

impl WorkflowGraph {
    /// 创建依赖图
    pub fn new(steps: &[StepSpec]) -> Result<Self, WorkflowError> {
        let mut order = Vec::with_capacity(steps.len());
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in steps {
            if in_degree.insert(step.id.clone(), 0).is_some() {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
            adjacency.insert(step.id.clone(), Vec::new());
            order.push(step.id.clone());
        }

        for step in steps {
            for dep in &step.depends_on {
                let Some(dependents) = adjacency.get_mut(dep) else {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                dependents.push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self {
            order,
            adjacency,
            in_degree,
        })
    }

    /// 拓扑序；同层按声明顺序。存在环时返回环上（无法排序）的步骤
    pub fn topological_order(&self) -> Result<Vec<StepId>, WorkflowError> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = self
            .order
            .iter()
            .filter(|id| degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for next in dependents {
                    if let Some(d) = degree.get_mut(next) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(next.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() < self.order.len() {
            let stuck = self
                .order
                .iter()
                .filter(|id| !sorted.contains(id))
                .cloned()
                .collect();
            return Err(WorkflowError::CyclicDependency(stuck));
        }
        Ok(sorted)
    }

    /// 直接依赖该步骤的步骤
    pub fn dependents(&self, step_id: &str) -> &[StepId] {
        self.adjacency
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
