//! 核心编排层：错误、事件、会话注册表、主控循环与构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod session;

pub use builder::{create_orchestrator, OrchestratorBuilder};
pub use error::OrchestratorError;
pub use events::{EventBus, EventPayload, OrchestratorEvent};
pub use orchestrator::{Orchestrator, Response, ResponseStatus, DEGRADED_REPLY, TASK_RESULT_TAG};
pub use session::{Session, SessionRegistry, SessionStatus};
