//! Worker 生命周期管理
//!
//! - 处于 spawning / running / interrupted 的 worker 数永不超过 max_concurrent
//! - 满载时任务进入待执行队列（任务保持 PENDING，重试任务保持 ASSIGNED），按优先级、再按到达顺序出队
//! - 每个 worker 有墙钟截止时间，超时按失败处理
//! - 所有池状态变更（派发、结束、取消、出队）都在同一把准入锁内完成，锁内不调用推理后端
//!
//! 结束事件经 mpsc 发给编排器，由决策器决定完成、重试或失败。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::planner::SystemLoad;
use crate::tasks::{Task, TaskError, TaskId, TaskPriority, TaskStatus, TaskStore};
use crate::worker::{
    InterruptDecision, Worker, WorkerContext, WorkerError, WorkerEvent, WorkerId, WorkerOutcome,
    WorkerReport, WorkerState, WorkerTask,
};

/// spawn 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Started(WorkerId),
    /// 已排队；position 从 1 开始
    Queued { position: usize },
}

pub(crate) struct WorkerSlot {
    pub(crate) state: WorkerState,
    worker_task: WorkerTask,
    cancel: CancellationToken,
    interrupt_tx: mpsc::UnboundedSender<String>,
    /// 被纠正后的新 worker 取代；结束时不回写任务、不上报
    superseded: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: TaskPriority,
    seq: u64,
    task_id: TaskId,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) workers: HashMap<WorkerId, WorkerSlot>,
    by_task: HashMap<TaskId, WorkerId>,
    terminated: HashSet<WorkerId>,
    pending: BinaryHeap<Queued>,
    seq: u64,
    peak_active: usize,
    shutting_down: bool,
}

impl PoolState {
    fn active(&self) -> usize {
        self.workers.values().filter(|w| w.state.is_active()).count()
    }

    fn is_queued(&self, task_id: &str) -> bool {
        self.pending.iter().any(|q| q.task_id == task_id)
    }

    fn position_of(&self, task_id: &str) -> Option<usize> {
        let me = self.pending.iter().find(|q| q.task_id == task_id)?;
        Some(self.pending.iter().filter(|q| *q > me).count() + 1)
    }

    fn enqueue(&mut self, task: &Task) {
        self.seq += 1;
        self.pending.push(Queued {
            priority: task.priority,
            seq: self.seq,
            task_id: task.id.clone(),
        });
    }
}

/// 已在锁内占位、待在锁外启动的 worker
struct Launch {
    worker_task: WorkerTask,
    cancel: CancellationToken,
    interrupts: mpsc::UnboundedReceiver<String>,
}

pub struct WorkerManager {
    pool: Arc<Mutex<PoolState>>,
    worker: Arc<dyn Worker>,
    tasks: Arc<TaskStore>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    max_concurrent: usize,
    timeout: Duration,
}

impl WorkerManager {
    /// 创建管理器，同时返回按任务有序的事件接收端
    pub fn new(
        worker: Arc<dyn Worker>,
        tasks: Arc<TaskStore>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            pool: Arc::new(Mutex::new(PoolState::default())),
            worker,
            tasks,
            events,
            max_concurrent: max_concurrent.max(1),
            timeout,
        });
        (manager, events_rx)
    }

    // 锁内只做内存操作；中毒时接管数据继续运行
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 派发任务：有空位立即启动，否则排队。排队任务不会被新任务插队
    pub fn spawn(self: &Arc<Self>, task_id: &str) -> Result<SpawnOutcome, WorkerError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if task.is_terminal() {
            return Err(TaskError::InvalidTransition {
                id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Running,
            }
            .into());
        }

        let (outcome, launches) = {
            let mut pool = self.lock();
            if pool.shutting_down {
                return Err(WorkerError::ShuttingDown);
            }
            if pool.by_task.contains_key(task_id) || pool.is_queued(task_id) {
                return Err(WorkerError::AlreadyActive(task_id.to_string()));
            }
            pool.enqueue(&task);
            let launches = self.drain_pending(&mut pool);
            let outcome = self.admission_outcome(&pool, &task, &launches);
            (outcome, launches)
        };

        if let SpawnOutcome::Queued { position } = &outcome {
            tracing::info!("Pool saturated, task {} queued at position {}", task_id, position);
        }
        self.launch_all(launches);
        Ok(outcome)
    }

    /// 取消单个 worker；返回是否发出了取消信号
    pub fn cancel(self: &Arc<Self>, worker_id: &str) -> bool {
        let (signalled, launches) = {
            let mut pool = self.lock();
            let signalled = match pool.workers.get_mut(worker_id) {
                Some(slot) if slot.state.is_active() => {
                    slot.state = WorkerState::Cancelling;
                    slot.cancel.cancel();
                    true
                }
                _ => false,
            };
            let launches = if signalled {
                self.drain_pending(&mut pool)
            } else {
                Vec::new()
            };
            (signalled, launches)
        };
        if signalled {
            tracing::info!("Worker {} cancelling", worker_id);
        }
        self.launch_all(launches);
        signalled
    }

    /// 取消任务：先把任务置为 CANCELLED（之后到达的结果一律丢弃），再撤出队列或通知其 worker
    pub fn cancel_task(self: &Arc<Self>, task_id: &str) -> Result<bool, WorkerError> {
        let cancelled = self.tasks.cancel(task_id)?;
        let launches = {
            let mut pool = self.lock();
            pool.pending.retain(|q| q.task_id != task_id);
            if let Some(worker_id) = pool.by_task.get(task_id).cloned() {
                if let Some(slot) = pool.workers.get_mut(&worker_id) {
                    if slot.state.is_active() {
                        slot.state = WorkerState::Cancelling;
                        slot.cancel.cancel();
                    }
                }
            }
            self.drain_pending(&mut pool)
        };
        self.launch_all(launches);
        Ok(cancelled)
    }

    /// 以修订后的描述重新派发：原 worker 进入 cancelling 并被取代，retry_count 不变
    pub fn replace(
        self: &Arc<Self>,
        task_id: &str,
        description: impl Into<String>,
    ) -> Result<SpawnOutcome, WorkerError> {
        let description = description.into();
        let (outcome, launches) = {
            let mut pool = self.lock();
            if pool.shutting_down {
                return Err(WorkerError::ShuttingDown);
            }
            let current = self
                .tasks
                .get(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            let live = pool
                .by_task
                .get(task_id)
                .is_some_and(|id| pool.workers.contains_key(id));
            let queued = pool.position_of(task_id);
            if !live && queued.is_none() && current.status == TaskStatus::Running {
                // 上一个 worker 已交还名额，结果正在回写
                return Err(WorkerError::NotFound(task_id.to_string()));
            }

            self.tasks.amend_description(task_id, description)?;
            let _ = self.events.send(WorkerEvent::Replaced {
                task_id: task_id.to_string(),
                session_id: current.session_id.clone(),
            });
            if let Some(position) = queued {
                // 尚未启动，出队时会读取新描述
                return Ok(SpawnOutcome::Queued { position });
            }
            let task = self
                .tasks
                .get(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

            let previous = pool.by_task.remove(task_id);
            let mut freed_slot = false;
            if let Some(old) = previous.as_ref().and_then(|id| pool.workers.get_mut(id)) {
                freed_slot = old.state.is_active();
                old.superseded = true;
                old.state = WorkerState::Cancelling;
                old.cancel.cancel();
            }
            if let Some(old) = &previous {
                tracing::info!("Worker {} superseded by a corrected plan for {}", old, task_id);
            }

            if freed_slot {
                // 直接接管被取代者的名额
                let launch = self.reserve(&mut pool, &task);
                let id = launch.worker_task.worker_id.clone();
                (SpawnOutcome::Started(id), vec![launch])
            } else {
                pool.enqueue(&task);
                let launches = self.drain_pending(&mut pool);
                let outcome = self.admission_outcome(&pool, &task, &launches);
                (outcome, launches)
            }
        };
        self.launch_all(launches);
        Ok(outcome)
    }

    /// 向运行中的 worker 投递用户消息，并按 worker 自己的策略执行 continue / modify / cancel
    pub fn interrupt(
        self: &Arc<Self>,
        worker_id: &str,
        message: &str,
    ) -> Result<InterruptDecision, WorkerError> {
        let worker_task = {
            let mut pool = self.lock();
            let slot = pool
                .workers
                .get_mut(worker_id)
                .filter(|s| s.state.is_active())
                .ok_or_else(|| WorkerError::NotFound(worker_id.to_string()))?;
            slot.state = WorkerState::Interrupted;
            let _ = slot.interrupt_tx.send(message.to_string());
            slot.worker_task.clone()
        };

        let decision = self.worker.on_interrupt(&worker_task, message);
        tracing::info!("Worker {} interrupt decision: {:?}", worker_id, decision);
        match &decision {
            InterruptDecision::Continue => {}
            InterruptDecision::Modify(description) => {
                self.replace(&worker_task.task_id, description.clone())?;
            }
            InterruptDecision::Cancel => {
                self.cancel_task(&worker_task.task_id)?;
            }
        }
        Ok(decision)
    }

    pub fn status(&self, worker_id: &str) -> Option<WorkerState> {
        let pool = self.lock();
        match pool.workers.get(worker_id) {
            Some(slot) => Some(slot.state),
            None if pool.terminated.contains(worker_id) => Some(WorkerState::Terminated),
            None => None,
        }
    }

    /// 任务当前的活跃 worker
    pub fn worker_for_task(&self, task_id: &str) -> Option<WorkerId> {
        let pool = self.lock();
        pool.by_task
            .get(task_id)
            .filter(|id| pool.workers.get(*id).is_some_and(|s| s.state.is_active()))
            .cloned()
    }

    pub fn is_queued(&self, task_id: &str) -> bool {
        self.lock().is_queued(task_id)
    }

    /// 瞬时负载
    pub fn load(&self) -> SystemLoad {
        let pool = self.lock();
        SystemLoad {
            active_workers: pool.active(),
            max_concurrent: self.max_concurrent,
            queued: pool.pending.len(),
        }
    }

    /// 观测到的最大并发数
    pub fn peak_active(&self) -> usize {
        self.lock().peak_active
    }

    /// 停止接收新任务，取消所有 worker 与排队任务
    pub fn shutdown(&self) {
        let queued: Vec<TaskId> = {
            let mut pool = self.lock();
            pool.shutting_down = true;
            for slot in pool.workers.values_mut() {
                if slot.state.is_active() {
                    slot.state = WorkerState::Cancelling;
                }
                slot.cancel.cancel();
            }
            std::mem::take(&mut pool.pending)
                .into_iter()
                .map(|q| q.task_id)
                .collect()
        };
        for task_id in queued {
            let _ = self.tasks.cancel(&task_id);
        }
        tracing::info!("Worker manager shut down");
    }

    /// 在锁内按顺序出队，直到占满并发名额
    fn drain_pending(&self, pool: &mut PoolState) -> Vec<Launch> {
        let mut launches = Vec::new();
        while !pool.shutting_down && pool.active() < self.max_concurrent {
            let Some(next) = pool.pending.pop() else {
                break;
            };
            match self.tasks.get(&next.task_id) {
                Some(task) if !task.is_terminal() => launches.push(self.reserve(pool, &task)),
                _ => tracing::debug!("Dropping stale queue entry {}", next.task_id),
            }
        }
        launches
    }

    /// 入队后的结局；仍在排队时在锁内发出 Queued，保证它先于该任务的 Started
    fn admission_outcome(&self, pool: &PoolState, task: &Task, launches: &[Launch]) -> SpawnOutcome {
        if let Some(l) = launches.iter().find(|l| l.worker_task.task_id == task.id) {
            return SpawnOutcome::Started(l.worker_task.worker_id.clone());
        }
        let position = pool.position_of(&task.id).unwrap_or(1);
        let _ = self.events.send(WorkerEvent::Queued {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            position,
        });
        SpawnOutcome::Queued { position }
    }

    /// 在锁内占位（spawning），生成新的工作单元
    fn reserve(&self, pool: &mut PoolState, task: &Task) -> Launch {
        let worker_id = format!("worker_{}", uuid::Uuid::new_v4());
        let worker_task = WorkerTask::from_task(task, worker_id.clone(), self.timeout);
        let cancel = CancellationToken::new();
        let (interrupt_tx, interrupts) = mpsc::unbounded_channel();

        pool.workers.insert(
            worker_id.clone(),
            WorkerSlot {
                state: WorkerState::Spawning,
                worker_task: worker_task.clone(),
                cancel: cancel.clone(),
                interrupt_tx,
                superseded: false,
            },
        );
        pool.by_task.insert(task.id.clone(), worker_id);
        let active = pool.active();
        pool.peak_active = pool.peak_active.max(active);

        Launch {
            worker_task,
            cancel,
            interrupts,
        }
    }

    fn launch_all(self: &Arc<Self>, launches: Vec<Launch>) {
        for launch in launches {
            self.launch(launch);
        }
    }

    /// 锁外启动：任务推进到 RUNNING，发出 started 事件，进入执行
    fn launch(self: &Arc<Self>, launch: Launch) {
        let Launch {
            worker_task,
            cancel,
            interrupts,
        } = launch;

        if let Err(e) = self.tasks.advance_to_running(&worker_task.task_id) {
            tracing::warn!("Cannot start {}: {}", worker_task.task_id, e);
            self.finalize(&worker_task, WorkerOutcome::Cancelled, Duration::ZERO);
            return;
        }

        {
            let mut pool = self.lock();
            if let Some(slot) = pool.workers.get_mut(&worker_task.worker_id) {
                if slot.state == WorkerState::Spawning {
                    slot.state = WorkerState::Running;
                }
            }
        }
        let _ = self.events.send(WorkerEvent::Started {
            worker_id: worker_task.worker_id.clone(),
            task_id: worker_task.task_id.clone(),
            session_id: worker_task.session_id.clone(),
            attempt: worker_task.attempt,
        });
        tracing::info!(
            "Worker {} started for task {} (attempt {})",
            worker_task.worker_id,
            worker_task.task_id,
            worker_task.attempt
        );

        let ctx = WorkerContext::new(
            worker_task.worker_id.clone(),
            worker_task.task_id.clone(),
            worker_task.session_id.clone(),
            cancel.clone(),
            interrupts,
            Arc::clone(&self.pool),
            Arc::clone(&self.tasks),
            self.events.clone(),
        );
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let deadline = tokio::time::Instant::now() + worker_task.timeout;
            let outcome = tokio::select! {
                res = manager.worker.execute(worker_task.clone(), ctx) => match res {
                    Ok(output) => WorkerOutcome::Succeeded(output),
                    Err(WorkerError::Cancelled) => WorkerOutcome::Cancelled,
                    Err(e) => WorkerOutcome::Failed(e.to_string()),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    cancel.cancel();
                    tracing::warn!("Worker {} exceeded its deadline", worker_task.worker_id);
                    WorkerOutcome::TimedOut
                }
                // 取消后仍在途的后端调用随 future 一起丢弃
                _ = cancel.cancelled() => WorkerOutcome::Cancelled,
            };
            manager.finalize(&worker_task, outcome, started.elapsed());
        });
    }

    /// worker 结束：在锁内释放名额并出队，锁外回写任务、上报并启动出队的任务
    fn finalize(self: &Arc<Self>, worker_task: &WorkerTask, outcome: WorkerOutcome, elapsed: Duration) {
        let (superseded, launches) = {
            let mut pool = self.lock();
            let superseded = pool
                .workers
                .remove(&worker_task.worker_id)
                .is_some_and(|slot| slot.superseded);
            pool.terminated.insert(worker_task.worker_id.clone());
            if pool.by_task.get(&worker_task.task_id) == Some(&worker_task.worker_id) {
                pool.by_task.remove(&worker_task.task_id);
            }
            (superseded, self.drain_pending(&mut pool))
        };

        // 被取代或被丢弃的尝试同样计入用量
        if let Err(e) = self
            .tasks
            .record_execution(&worker_task.task_id, outcome.token_usage(), elapsed)
        {
            tracing::debug!("No execution record for {}: {}", worker_task.task_id, e);
        }
        if superseded {
            tracing::debug!("Superseded worker {} terminated", worker_task.worker_id);
        } else {
            self.settle(worker_task, outcome, elapsed);
        }
        self.launch_all(launches);
    }

    fn settle(&self, worker_task: &WorkerTask, outcome: WorkerOutcome, elapsed: Duration) {
        let task_id = &worker_task.task_id;
        let discarded = match &outcome {
            WorkerOutcome::Succeeded(output) => self.tasks.complete(task_id, output.result.clone()).is_err(),
            WorkerOutcome::Failed(_) | WorkerOutcome::TimedOut => {
                let summary = outcome.error_summary().unwrap_or_default();
                self.tasks.fail(task_id, summary).is_err()
            }
            WorkerOutcome::Cancelled => {
                let _ = self.tasks.cancel(task_id);
                // 任务已以其他结局结束时，这次取消只是迟到的收尾
                self.tasks.status(task_id) != Some(TaskStatus::Cancelled)
            }
        };
        if discarded {
            tracing::info!("Discarding late result of {} for terminal task {}", worker_task.worker_id, task_id);
        } else {
            tracing::info!(
                "Worker {} finished task {} in {:?}: {}",
                worker_task.worker_id,
                task_id,
                elapsed,
                if outcome.is_success() { "ok" } else { "failed" }
            );
        }

        let _ = self.events.send(WorkerEvent::Finished(WorkerReport {
            worker_id: worker_task.worker_id.clone(),
            worker_task_id: worker_task.id.clone(),
            task_id: task_id.clone(),
            session_id: worker_task.session_id.clone(),
            attempt: worker_task.attempt,
            outcome,
            discarded,
            elapsed,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskStatus, TaskType};
    use crate::worker::WorkerOutput;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// 等待外部放行的 worker
    struct GatedWorker {
        gate: Arc<Notify>,
        policy: InterruptDecision,
    }

    #[async_trait]
    impl Worker for GatedWorker {
        async fn execute(
            &self,
            task: WorkerTask,
            mut ctx: WorkerContext,
        ) -> Result<WorkerOutput, WorkerError> {
            ctx.report_progress(0.5);
            self.gate.notified().await;
            let notes = ctx.checkpoint().await?;
            if task.description.contains("explode") {
                return Err(WorkerError::Execution("exploded".into()));
            }
            Ok(WorkerOutput::new(format!("{} [{} notes]", task.description, notes.len())))
        }

        fn on_interrupt(&self, _task: &WorkerTask, _message: &str) -> InterruptDecision {
            self.policy.clone()
        }
    }

    fn setup(
        max: usize,
        timeout: Duration,
        policy: InterruptDecision,
    ) -> (
        Arc<WorkerManager>,
        mpsc::UnboundedReceiver<WorkerEvent>,
        Arc<TaskStore>,
        Arc<Notify>,
    ) {
        let tasks = Arc::new(TaskStore::new());
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(GatedWorker {
            gate: gate.clone(),
            policy,
        });
        let (manager, rx) = WorkerManager::new(worker, tasks.clone(), max, timeout);
        (manager, rx, tasks, gate)
    }

    fn add_task(tasks: &TaskStore, desc: &str, priority: TaskPriority) -> TaskId {
        tasks
            .insert(Task::new("s1", TaskType::CodeGeneration, desc).with_priority(priority))
            .unwrap()
    }

    async fn next_finished(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerReport {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(WorkerEvent::Finished(report))) => return report,
                Ok(Some(_)) => continue,
                other => panic!("no finished event: {:?}", other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_sixth_spawn_is_queued_then_dequeued() {
        let (manager, mut rx, tasks, gate) =
            setup(5, Duration::from_secs(30), InterruptDecision::Continue);
        let ids: Vec<TaskId> = (0..6)
            .map(|i| add_task(&tasks, &format!("job {i}"), TaskPriority::Normal))
            .collect();

        for id in &ids[..5] {
            assert!(matches!(manager.spawn(id).unwrap(), SpawnOutcome::Started(_)));
        }
        assert_eq!(
            manager.spawn(&ids[5]).unwrap(),
            SpawnOutcome::Queued { position: 1 }
        );
        assert_eq!(tasks.status(&ids[5]), Some(TaskStatus::Pending));
        assert_eq!(manager.load().active_workers, 5);

        gate.notify_one();
        next_finished(&mut rx).await;
        // 出队与名额释放在同一把锁内完成
        assert!(manager.worker_for_task(&ids[5]).is_some());
        assert_eq!(tasks.status(&ids[5]), Some(TaskStatus::Running));
        assert_eq!(manager.peak_active(), 5);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_queue_and_replace_events_precede_start() {
        let (manager, mut rx, tasks, gate) =
            setup(1, Duration::from_secs(30), InterruptDecision::Continue);
        let first = add_task(&tasks, "first", TaskPriority::Normal);
        let second = add_task(&tasks, "second", TaskPriority::Normal);
        manager.spawn(&first).unwrap();
        manager.spawn(&second).unwrap();
        manager.replace(&second, "second, revised").unwrap();

        let mut seen = Vec::new();
        gate.notify_one();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                WorkerEvent::Queued { task_id, .. } if task_id == second => seen.push("queued"),
                WorkerEvent::Replaced { task_id, .. } if task_id == second => seen.push("replaced"),
                WorkerEvent::Started { task_id, .. } if task_id == second => seen.push("started"),
                WorkerEvent::Finished(report) if report.task_id == second => {
                    seen.push("finished");
                    break;
                }
                WorkerEvent::Finished(_) => gate.notify_one(),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["queued", "replaced", "started", "finished"]);
        assert!(tasks.get(&second).unwrap().result.unwrap().starts_with("second, revised"));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_dequeue_respects_priority_then_arrival() {
        let (manager, mut rx, tasks, gate) =
            setup(1, Duration::from_secs(30), InterruptDecision::Continue);
        let first = add_task(&tasks, "first", TaskPriority::Normal);
        let low = add_task(&tasks, "low", TaskPriority::Low);
        let normal = add_task(&tasks, "normal", TaskPriority::Normal);
        let urgent = add_task(&tasks, "urgent", TaskPriority::Urgent);

        manager.spawn(&first).unwrap();
        manager.spawn(&low).unwrap();
        manager.spawn(&normal).unwrap();
        assert_eq!(
            manager.spawn(&urgent).unwrap(),
            SpawnOutcome::Queued { position: 1 }
        );

        let mut order = Vec::new();
        for _ in 0..4 {
            gate.notify_one();
            order.push(next_finished(&mut rx).await.task_id);
        }
        assert_eq!(order, vec![first, urgent, normal, low]);
    }

    #[tokio::test]
    async fn test_deadline_counts_as_failure() {
        let (manager, mut rx, tasks, _gate) =
            setup(2, Duration::from_millis(30), InterruptDecision::Continue);
        let id = add_task(&tasks, "slow", TaskPriority::Normal);
        let SpawnOutcome::Started(worker_id) = manager.spawn(&id).unwrap() else {
            panic!("expected start");
        };

        let report = next_finished(&mut rx).await;
        assert_eq!(report.outcome, WorkerOutcome::TimedOut);
        assert_eq!(tasks.status(&id), Some(TaskStatus::Failed));
        assert_eq!(manager.status(&worker_id), Some(WorkerState::Terminated));
    }

    #[tokio::test]
    async fn test_execution_error_fails_task() {
        let (manager, mut rx, tasks, gate) =
            setup(2, Duration::from_secs(30), InterruptDecision::Continue);
        let id = add_task(&tasks, "explode please", TaskPriority::Normal);
        manager.spawn(&id).unwrap();
        gate.notify_one();
        let report = next_finished(&mut rx).await;
        assert!(!report.outcome.is_success());
        let task = tasks.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn test_cancel_task_wins_over_late_result() {
        let (manager, mut rx, tasks, _gate) =
            setup(2, Duration::from_secs(30), InterruptDecision::Continue);
        let id = add_task(&tasks, "job", TaskPriority::Normal);
        let SpawnOutcome::Started(worker_id) = manager.spawn(&id).unwrap() else {
            panic!("expected start");
        };

        assert!(manager.cancel_task(&id).unwrap());
        assert_eq!(tasks.status(&id), Some(TaskStatus::Cancelled));
        let report = next_finished(&mut rx).await;
        assert_eq!(report.outcome, WorkerOutcome::Cancelled);
        assert_eq!(manager.status(&worker_id), Some(WorkerState::Terminated));
        assert_eq!(manager.load().active_workers, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_removes_it() {
        let (manager, _rx, tasks, _gate) =
            setup(1, Duration::from_secs(30), InterruptDecision::Continue);
        let a = add_task(&tasks, "a", TaskPriority::Normal);
        let b = add_task(&tasks, "b", TaskPriority::Normal);
        manager.spawn(&a).unwrap();
        manager.spawn(&b).unwrap();
        assert!(manager.is_queued(&b));

        assert!(manager.cancel_task(&b).unwrap());
        assert!(!manager.is_queued(&b));
        assert_eq!(tasks.status(&b), Some(TaskStatus::Cancelled));
        assert!(manager.spawn(&b).is_err());
    }

    #[tokio::test]
    async fn test_replace_supersedes_running_worker() {
        let (manager, mut rx, tasks, gate) =
            setup(1, Duration::from_secs(30), InterruptDecision::Continue);
        let id = add_task(&tasks, "fix login", TaskPriority::Normal);
        let SpawnOutcome::Started(old) = manager.spawn(&id).unwrap() else {
            panic!("expected start");
        };

        let SpawnOutcome::Started(new) = manager.replace(&id, "fix login and add a test").unwrap()
        else {
            panic!("replacement should take the freed slot");
        };
        assert_ne!(old, new);
        assert!(matches!(
            manager.status(&old),
            Some(WorkerState::Cancelling) | Some(WorkerState::Terminated)
        ));
        assert_eq!(tasks.get(&id).unwrap().retry_count, 0);

        // 等被取代者退出，避免放行信号落到它身上
        while manager.status(&old) != Some(WorkerState::Terminated) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gate.notify_one();
        let report = next_finished(&mut rx).await;
        assert_eq!(report.worker_id, new);
        let task = tasks.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.result.unwrap().starts_with("fix login and add a test"));
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_interrupt_policies() {
        // continue：消息在检查点交给 worker
        let (manager, mut rx, tasks, gate) =
            setup(1, Duration::from_secs(30), InterruptDecision::Continue);
        let id = add_task(&tasks, "job", TaskPriority::Normal);
        let SpawnOutcome::Started(worker_id) = manager.spawn(&id).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(
            manager.interrupt(&worker_id, "use tabs").unwrap(),
            InterruptDecision::Continue
        );
        assert_eq!(manager.status(&worker_id), Some(WorkerState::Interrupted));
        gate.notify_one();
        next_finished(&mut rx).await;
        assert_eq!(tasks.get(&id).unwrap().result.as_deref(), Some("job [1 notes]"));

        // cancel：任务立即取消
        let (manager, _rx, tasks, _gate) =
            setup(1, Duration::from_secs(30), InterruptDecision::Cancel);
        let id = add_task(&tasks, "job", TaskPriority::Normal);
        let SpawnOutcome::Started(worker_id) = manager.spawn(&id).unwrap() else {
            panic!("expected start");
        };
        manager.interrupt(&worker_id, "stop").unwrap();
        assert_eq!(tasks.status(&id), Some(TaskStatus::Cancelled));
        assert!(manager.interrupt("worker_missing", "hi").is_err());
    }
}
