//! 任务模型：Task 记录、状态机与按 ID 索引的任务仓库

pub mod store;
pub mod types;

pub use store::TaskStore;
pub use types::{Task, TaskError, TaskId, TaskPriority, TaskStatus, TaskType};
