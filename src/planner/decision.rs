//! 决策器：(trigger, planning_result, system_load) → ExecutionDecision
//!
//! 纯函数、无 I/O。按以下顺序求值，先命中者生效：
//! 1. 取消且目标任务活跃 → complete_task(cancelled)，不看负载
//! 2. 纠正且目标任务有 worker 在跑 → spawn_worker(修订后的描述)；否则按新消息处理
//! 3. 新消息，动作为 reply 或置信度低于阈值 → reply
//! 4. 新消息，动作为 complete 且会话有活跃任务 → await_result
//! 5. 新消息，需委派且 subagent 属于外部代理 → delegate_external
//! 6. 新消息，需委派且池未满 → spawn_worker
//! 7. 新消息，需委派但池已满 → request_info（排队，任务进入 PENDING）
//! 8. worker 结果：成功 → complete_task；失败且有重试预算 → spawn_worker(retry)；预算耗尽 → complete_task(failed)
//!
//! 其余组合记为 DecisionError 并按 3 处理（直接回复，不委派）。

use std::collections::HashSet;

use thiserror::Error;

use crate::config::OrchestratorSection;
use crate::planner::{
    DecisionAction, ExecutionDecision, PlanAction, PlanningResult, SystemLoad, Trigger,
};
use crate::tasks::TaskStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecisionError {
    #[error("No decision rule covers trigger '{trigger}': {reason}")]
    Uncovered {
        trigger: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct DecisionMaker {
    confidence_threshold: f32,
    complexity_threshold: u32,
    external_agents: HashSet<String>,
}

impl Default for DecisionMaker {
    fn default() -> Self {
        Self::from_config(&OrchestratorSection::default())
    }
}

impl DecisionMaker {
    pub fn new(confidence_threshold: f32, complexity_threshold: u32) -> Self {
        Self {
            confidence_threshold,
            complexity_threshold,
            external_agents: HashSet::new(),
        }
    }

    pub fn from_config(cfg: &OrchestratorSection) -> Self {
        Self::new(cfg.confidence_threshold, cfg.complexity_threshold)
            .with_external_agents(cfg.external_agents.iter().cloned())
    }

    pub fn with_external_agents(mut self, agents: impl IntoIterator<Item = String>) -> Self {
        self.external_agents.extend(agents);
        self
    }

    /// 委派是否应先拆解为多步工作流
    pub fn needs_workflow(&self, planning: &PlanningResult) -> bool {
        planning.action == PlanAction::MultiStep
            || (planning.action == PlanAction::Delegate
                && planning.estimated_steps >= self.complexity_threshold)
    }

    pub fn decide(
        &self,
        trigger: &Trigger,
        planning: &PlanningResult,
        load: &SystemLoad,
    ) -> ExecutionDecision {
        match self.try_decide(trigger, planning, load) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!("{}", e);
                ExecutionDecision::reply(planning.justification.clone())
            }
        }
    }

    fn try_decide(
        &self,
        trigger: &Trigger,
        planning: &PlanningResult,
        load: &SystemLoad,
    ) -> Result<ExecutionDecision, DecisionError> {
        match trigger {
            Trigger::Cancellation {
                task_id: Some(task_id),
                task_active: true,
            } => Ok(ExecutionDecision::complete(task_id.clone(), TaskStatus::Cancelled)
                .with_message("Task cancelled.")),
            Trigger::Cancellation { task_id, .. } => Err(DecisionError::Uncovered {
                trigger: trigger.kind(),
                reason: format!("no active task to cancel ({:?})", task_id),
            }),

            Trigger::Correction {
                task_id,
                worker_running: true,
                amended_description,
            } => Ok(ExecutionDecision::new(DecisionAction::SpawnWorker)
                .with_target(task_id.clone())
                .with_message(amended_description.clone())),
            Trigger::Correction { task_id, .. } => {
                self.on_new_message(Some(task_id.as_str()), trigger, planning, load)
            }

            Trigger::NewMessage { active_task } => {
                self.on_new_message(active_task.as_deref(), trigger, planning, load)
            }

            Trigger::WorkerResult {
                task_id,
                task_cancelled: true,
                ..
            } => Ok(ExecutionDecision::complete(task_id.clone(), TaskStatus::Cancelled)),
            Trigger::WorkerResult {
                task_id,
                success: true,
                ..
            } => Ok(ExecutionDecision::complete(task_id.clone(), TaskStatus::Completed)),
            Trigger::WorkerResult {
                task_id,
                retry_count,
                max_retries,
                ..
            } if retry_count < max_retries => {
                let mut d = ExecutionDecision::new(DecisionAction::SpawnWorker)
                    .with_target(task_id.clone())
                    .with_message(format!("Retrying ({}/{})", retry_count + 1, max_retries));
                d.retry = true;
                Ok(d)
            }
            Trigger::WorkerResult { task_id, .. } => {
                Ok(ExecutionDecision::complete(task_id.clone(), TaskStatus::Failed))
            }
        }
    }

    fn on_new_message(
        &self,
        active_task: Option<&str>,
        trigger: &Trigger,
        planning: &PlanningResult,
        load: &SystemLoad,
    ) -> Result<ExecutionDecision, DecisionError> {
        if planning.action == PlanAction::Reply || planning.confidence < self.confidence_threshold {
            return Ok(ExecutionDecision::reply(planning.justification.clone()));
        }

        if planning.action == PlanAction::Complete {
            return match active_task {
                Some(task_id) => {
                    Ok(ExecutionDecision::new(DecisionAction::AwaitResult).with_target(task_id))
                }
                None => Err(DecisionError::Uncovered {
                    trigger: trigger.kind(),
                    reason: "'complete' judgement without an active task".to_string(),
                }),
            };
        }

        // 此处 action 必为 delegate / multi_step
        if let Some(agent) = planning
            .subagent_type
            .as_deref()
            .filter(|a| self.external_agents.contains(*a))
        {
            return Ok(ExecutionDecision::new(DecisionAction::DelegateExternal)
                .with_message(format!("Handed off to external agent '{}'.", agent)));
        }

        let multi_step = self.needs_workflow(planning);
        let mut decision = if load.saturated() {
            let mut d = ExecutionDecision::new(DecisionAction::RequestInfo).with_message(format!(
                "All {} workers are busy; your task is queued at position {}.",
                load.max_concurrent,
                load.queued + 1
            ));
            d.queued = true;
            d
        } else {
            ExecutionDecision::new(DecisionAction::SpawnWorker)
        };
        decision.multi_step = multi_step;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskType;

    fn maker() -> DecisionMaker {
        DecisionMaker::new(0.5, 3).with_external_agents(["browser".to_string()])
    }

    fn idle() -> SystemLoad {
        SystemLoad {
            active_workers: 0,
            max_concurrent: 5,
            queued: 0,
        }
    }

    fn full() -> SystemLoad {
        SystemLoad {
            active_workers: 5,
            max_concurrent: 5,
            queued: 2,
        }
    }

    fn delegate() -> PlanningResult {
        PlanningResult::delegate(TaskType::CodeGeneration, 0.9)
    }

    fn new_msg(active: Option<&str>) -> Trigger {
        Trigger::NewMessage {
            active_task: active.map(str::to_string),
        }
    }

    /// 表驱动：新消息路径
    #[test]
    fn test_new_message_table() {
        let cases: Vec<(&str, PlanningResult, Option<&str>, SystemLoad, DecisionAction)> = vec![
            ("reply wins", PlanningResult::reply("hi"), None, idle(), DecisionAction::Reply),
            ("low confidence", delegate().with_confidence(0.2), None, idle(), DecisionAction::Reply),
            ("degraded", PlanningResult::degraded("timeout"), None, idle(), DecisionAction::Reply),
            ("delegate idle", delegate(), None, idle(), DecisionAction::SpawnWorker),
            ("delegate saturated", delegate(), None, full(), DecisionAction::RequestInfo),
            (
                "multi step idle",
                delegate().with_action(PlanAction::MultiStep),
                None,
                idle(),
                DecisionAction::SpawnWorker,
            ),
            (
                "status while running",
                delegate().with_action(PlanAction::Complete),
                Some("task_1"),
                idle(),
                DecisionAction::AwaitResult,
            ),
            (
                "status without task",
                delegate().with_action(PlanAction::Complete),
                None,
                idle(),
                DecisionAction::Reply,
            ),
            (
                "external agent",
                delegate().with_subagent("browser"),
                None,
                full(),
                DecisionAction::DelegateExternal,
            ),
            (
                "internal agent",
                delegate().with_subagent("coder"),
                None,
                idle(),
                DecisionAction::SpawnWorker,
            ),
        ];

        let m = maker();
        for (name, planning, active, load, expected) in cases {
            let d = m.decide(&new_msg(active), &planning, &load);
            assert_eq!(d.action, expected, "case: {name}");
        }
    }

    #[test]
    fn test_saturated_delegate_is_queued() {
        let d = maker().decide(&new_msg(None), &delegate(), &full());
        assert!(d.queued);
        assert!(d.message.unwrap().contains("position 3"));
    }

    #[test]
    fn test_multi_step_by_estimate() {
        let m = maker();
        let d = m.decide(&new_msg(None), &delegate().with_steps(4), &idle());
        assert!(d.multi_step);
        let d = m.decide(&new_msg(None), &delegate().with_steps(1), &idle());
        assert!(!d.multi_step);
    }

    #[test]
    fn test_cancellation_always_wins() {
        let m = maker();
        let trigger = Trigger::Cancellation {
            task_id: Some("task_1".into()),
            task_active: true,
        };
        for planning in [
            PlanningResult::reply("x"),
            delegate(),
            PlanningResult::degraded("down"),
        ] {
            for load in [idle(), full()] {
                let d = m.decide(&trigger, &planning, &load);
                assert_eq!(d.action, DecisionAction::CompleteTask);
                assert_eq!(d.task_status, Some(TaskStatus::Cancelled));
                assert_eq!(d.target_task.as_deref(), Some("task_1"));
            }
        }
    }

    #[test]
    fn test_cancellation_without_target_replies() {
        let trigger = Trigger::Cancellation {
            task_id: None,
            task_active: false,
        };
        let d = maker().decide(&trigger, &PlanningResult::reply("nothing to cancel"), &idle());
        assert_eq!(d.action, DecisionAction::Reply);
    }

    #[test]
    fn test_correction_with_running_worker_respawns() {
        let trigger = Trigger::Correction {
            task_id: "task_1".into(),
            worker_running: true,
            amended_description: "fix login and add a test".into(),
        };
        let d = maker().decide(&trigger, &delegate(), &full());
        assert_eq!(d.action, DecisionAction::SpawnWorker);
        assert_eq!(d.message.as_deref(), Some("fix login and add a test"));
        assert!(!d.retry);
    }

    #[test]
    fn test_correction_without_worker_falls_through() {
        let trigger = Trigger::Correction {
            task_id: "task_1".into(),
            worker_running: false,
            amended_description: "x".into(),
        };
        let d = maker().decide(&trigger, &delegate(), &idle());
        assert_eq!(d.action, DecisionAction::SpawnWorker);
        let d = maker().decide(&trigger, &PlanningResult::reply("ok"), &idle());
        assert_eq!(d.action, DecisionAction::Reply);
    }

    #[test]
    fn test_worker_result_table() {
        let m = maker();
        let result = |success, retry_count, task_cancelled| Trigger::WorkerResult {
            task_id: "task_1".into(),
            success,
            retry_count,
            max_retries: 2,
            task_cancelled,
        };
        let any = PlanningResult::reply("");

        let d = m.decide(&result(true, 0, false), &any, &full());
        assert_eq!(d.task_status, Some(TaskStatus::Completed));

        let d = m.decide(&result(false, 1, false), &any, &full());
        assert_eq!(d.action, DecisionAction::SpawnWorker);
        assert!(d.retry);

        let d = m.decide(&result(false, 2, false), &any, &idle());
        assert_eq!(d.action, DecisionAction::CompleteTask);
        assert_eq!(d.task_status, Some(TaskStatus::Failed));

        // 取消与结果竞争：取消胜出
        let d = m.decide(&result(true, 0, true), &any, &idle());
        assert_eq!(d.task_status, Some(TaskStatus::Cancelled));
    }
}
