//! 规划层：任务分类、决策表与多步拆解

mod classifier;
mod decision;
mod step_planner;
mod types;

pub use classifier::{
    heuristics, infer_task_type, parse_judgement, ActiveTaskSummary, ClassificationError,
    HeuristicSignal, SessionContext, TaskClassifier,
};
pub use decision::{DecisionError, DecisionMaker};
pub use step_planner::{parse_steps, single_step, StepPlanner, StepSpec};
pub use types::{
    DecisionAction, ExecutionDecision, PlanAction, PlanningResult, SystemLoad, Trigger,
};
