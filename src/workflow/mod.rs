//! 工作流状态机：带依赖的多步计划，独立于单任务执行

pub mod builder;
pub mod engine;
pub mod graph;
pub mod types;

pub use builder::WorkflowBuilder;
pub use engine::WorkflowEngine;
pub use graph::WorkflowGraph;
pub use types::*;
