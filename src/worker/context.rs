//! Worker 执行上下文：取消令牌、中断队列、进度上报
//!
//! 中断是协作式的：worker 在每个检查点调用 `checkpoint()`，
//! 已取消时得到 `WorkerError::Cancelled`，否则取走排队的用户消息并回到 running。

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tasks::{TaskId, TaskStore};
use crate::worker::manager::PoolState;
use crate::worker::{WorkerError, WorkerEvent, WorkerId, WorkerState};

pub struct WorkerContext {
    worker_id: WorkerId,
    task_id: TaskId,
    session_id: String,
    cancel: CancellationToken,
    interrupts: mpsc::UnboundedReceiver<String>,
    pool: Arc<Mutex<PoolState>>,
    tasks: Arc<TaskStore>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: WorkerId,
        task_id: TaskId,
        session_id: String,
        cancel: CancellationToken,
        interrupts: mpsc::UnboundedReceiver<String>,
        pool: Arc<Mutex<PoolState>>,
        tasks: Arc<TaskStore>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            worker_id,
            task_id,
            session_id,
            cancel,
            interrupts,
            pool,
            tasks,
            events,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 等待取消（用于与后端调用 select）
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// 检查点：已取消则返回 Err(Cancelled)；否则取走所有中断消息，状态回到 running
    pub async fn checkpoint(&mut self) -> Result<Vec<String>, WorkerError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        let mut notes = Vec::new();
        while let Ok(msg) = self.interrupts.try_recv() {
            notes.push(msg);
        }
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = pool.workers.get_mut(&self.worker_id) {
            if slot.state == WorkerState::Interrupted {
                slot.state = WorkerState::Running;
            }
        }
        Ok(notes)
    }

    /// 上报进度；只增不减，增长时发出进度事件
    pub fn report_progress(&self, progress: f32) {
        let before = self
            .tasks
            .get(&self.task_id)
            .map(|t| t.progress)
            .unwrap_or(0.0);
        match self.tasks.update_progress(&self.task_id, progress) {
            Ok(now) if now > before => {
                let _ = self.events.send(WorkerEvent::Progress {
                    worker_id: self.worker_id.clone(),
                    task_id: self.task_id.clone(),
                    session_id: self.session_id.clone(),
                    progress: now,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Progress update ignored for {}: {}", self.task_id, e),
        }
    }
}
