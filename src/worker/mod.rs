//! Worker 层：执行单元抽象、并发受限的生命周期管理、协作式中断

mod context;
mod llm_worker;
mod manager;
mod traits;
mod types;

pub use context::WorkerContext;
pub use llm_worker::LlmWorker;
pub use manager::{SpawnOutcome, WorkerManager};
pub use traits::Worker;
pub use types::{
    InterruptDecision, WorkerError, WorkerEvent, WorkerId, WorkerOutcome, WorkerOutput,
    WorkerReport, WorkerState, WorkerTask,
};
