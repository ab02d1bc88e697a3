//! 编排器：会话入口与主控循环
//!
//! 每条入站消息：记入会话记忆 → 分类 → 生成触发器 → 决策 → 执行（直接回复 / 派发 worker /
//! 查询进度 / 取消 / 外部委派 / 多步工作流）。同一会话的消息串行处理，不同会话完全并行。
//!
//! 后台有两个循环：worker 事件循环（完成、重试、失败与工作流推进）与会话清扫（空闲过期、记忆保留策略）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::context::{ContextAssembler, FACT_TAG};
use crate::core::{EventBus, EventPayload, OrchestratorError, OrchestratorEvent, SessionRegistry, SessionStatus};
use crate::llm::{complete_with_timeout, CompletionOptions, LlmClient};
use crate::memory::{recent_history, MemoryRecord, MemoryStore, Message, RetentionPolicy, CONVERSATION_TAG};
use crate::planner::{
    single_step, ActiveTaskSummary, DecisionAction, DecisionMaker, ExecutionDecision, PlanAction,
    PlanningResult, SessionContext, StepPlanner, StepSpec, TaskClassifier, Trigger,
};
use crate::tasks::{Task, TaskError, TaskId, TaskStatus, TaskStore};
use crate::worker::{
    InterruptDecision, SpawnOutcome, WorkerError, WorkerEvent, WorkerManager, WorkerReport,
};
use crate::workflow::{WorkflowBuilder, WorkflowEngine, WorkflowStatus};

/// 推理后端不可用时的固定回复
pub const DEGRADED_REPLY: &str = "I'm running in degraded mode because the reasoning service is unavailable, \
so I can't plan or answer this right now. Please try again shortly.";

/// 任务结果记忆的标签
pub const TASK_RESULT_TAG: &str = "task_result";

/// 响应状态（机器可读）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Replied,
    Degraded,
    Spawned,
    Queued,
    Awaiting,
    Corrected,
    Cancelled,
    Delegated,
    SessionPaused,
    Error,
}

/// process_message 的返回：自然语言文本 + 状态码
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub text: String,
    pub status: ResponseStatus,
    /// 出错时为错误码，否则与 status 一致
    pub code: String,
    pub task_id: Option<TaskId>,
}

impl Response {
    pub fn new(text: impl Into<String>, status: ResponseStatus) -> Self {
        let code = serde_json::to_value(status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            text: text.into(),
            status,
            code,
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    fn with_status(mut self, status: ResponseStatus) -> Self {
        self.status = status;
        self
    }

    pub fn from_error(err: &OrchestratorError) -> Self {
        let mut response = Self::new(err.user_message(), ResponseStatus::Error);
        response.code = err.status_code().to_string();
        response
    }
}

/// 构建器交给编排器的组件
pub(crate) struct Components {
    pub config: Arc<AppConfig>,
    pub llm: Arc<dyn LlmClient>,
    pub memory: Arc<dyn MemoryStore>,
    pub tasks: Arc<TaskStore>,
    pub assembler: Arc<ContextAssembler>,
    pub classifier: TaskClassifier,
    pub decision: DecisionMaker,
    pub step_planner: StepPlanner,
    pub workers: Arc<WorkerManager>,
    pub worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
}

struct Inner {
    config: Arc<AppConfig>,
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn MemoryStore>,
    tasks: Arc<TaskStore>,
    assembler: Arc<ContextAssembler>,
    classifier: TaskClassifier,
    decision: DecisionMaker,
    step_planner: StepPlanner,
    workers: Arc<WorkerManager>,
    workflows: WorkflowEngine,
    sessions: SessionRegistry,
    events: EventBus,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// 启动后台循环；必须在 tokio 运行时内调用
    pub(crate) fn start(components: Components) -> Self {
        let Components {
            config,
            llm,
            memory,
            tasks,
            assembler,
            classifier,
            decision,
            step_planner,
            workers,
            worker_events,
        } = components;

        let inner = Arc::new(Inner {
            events: EventBus::new(config.orchestrator.event_capacity),
            sessions: SessionRegistry::new(config.session.idle_timeout()),
            workflows: WorkflowEngine::new(),
            session_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
            llm,
            memory,
            tasks,
            assembler,
            classifier,
            decision,
            step_planner,
            workers,
        });

        let reports = tokio::spawn(run_reports(Arc::clone(&inner), worker_events));
        let sweeper = tokio::spawn(run_sweeper(Arc::clone(&inner)));
        tracing::info!(
            "Orchestrator started (max_concurrent={}, max_retries={})",
            inner.config.orchestrator.max_concurrent,
            inner.config.orchestrator.max_retries
        );

        Self {
            inner,
            background: Mutex::new(vec![reports, sweeper]),
        }
    }

    /// 处理一条入站消息；永不返回原始错误
    pub async fn process_message(&self, session_id: &str, message: &str) -> Response {
        let lock = self.inner.session_lock(session_id);
        let _guard = lock.lock().await;
        match self.inner.handle_message(session_id, message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Message in session {} failed: {}", session_id, e);
                let response = Response::from_error(&e);
                self.inner.remember(session_id, &Message::assistant(response.text.clone()));
                response
            }
        }
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// 取消任务（含其工作流的所有步骤）；返回是否确实取消了
    pub fn cancel_task(&self, task_id: &str) -> Result<bool, OrchestratorError> {
        self.inner.cancel_task_tree(task_id)
    }

    /// 把一条消息作为旁路信号投递给任务当前的 worker，由 worker 的中断策略决定后续
    pub fn interrupt_task(
        &self,
        task_id: &str,
        message: &str,
    ) -> Result<InterruptDecision, OrchestratorError> {
        let task = self
            .inner
            .tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        let worker_id = self
            .inner
            .workers
            .worker_for_task(task_id)
            .ok_or_else(|| WorkerError::NotFound(task_id.to_string()))?;

        // Modify 的 TaskCorrected 由 worker 事件流按序发出
        let decision = self.inner.workers.interrupt(&worker_id, message)?;
        if decision == InterruptDecision::Cancel {
            self.inner.events.emit(EventPayload::TaskCancelled {
                task_id: task.id,
                session_id: task.session_id,
            });
        }
        Ok(decision)
    }

    pub fn pause_session(&self, session_id: &str) -> Result<SessionStatus, OrchestratorError> {
        self.inner.sessions.pause(session_id)
    }

    pub fn resume_session(&self, session_id: &str) -> Result<SessionStatus, OrchestratorError> {
        self.inner.sessions.resume(session_id)
    }

    /// 暂停工作流：已运行的步骤照常结束，但不再激活新步骤
    pub fn pause_workflow(&self, workflow_id: &str) -> Result<WorkflowStatus, OrchestratorError> {
        let status = self.inner.workflows.pause(workflow_id)?;
        tracing::info!("Workflow {} paused ({:?})", workflow_id, status);
        Ok(status)
    }

    /// 恢复工作流，并立即派发暂停期间变为就绪的步骤
    pub fn resume_workflow(&self, workflow_id: &str) -> Result<WorkflowStatus, OrchestratorError> {
        let status = self.inner.workflows.resume(workflow_id)?;
        if !status.is_finished() {
            self.inner.activate_steps(workflow_id)?;
        }
        let status = self
            .inner
            .workflows
            .status(workflow_id)
            .unwrap_or(status);
        tracing::info!("Workflow {} resumed ({:?})", workflow_id, status);
        Ok(status)
    }

    /// 关闭会话并取消其所有活跃任务，返回被取消的任务数
    pub async fn close_session(&self, session_id: &str) -> Result<usize, OrchestratorError> {
        let lock = self.inner.session_lock(session_id);
        let cancelled = {
            let _guard = lock.lock().await;
            let mut cancelled = 0;
            for task in self.inner.tasks.active_for_session(session_id) {
                if self.inner.cancel_task_tree(&task.id)? {
                    cancelled += 1;
                }
            }
            self.inner.sessions.close(session_id)?;
            cancelled
        };
        self.inner
            .session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        self.inner.events.emit(EventPayload::SessionClosed {
            session_id: session_id.to_string(),
        });
        tracing::info!("Session {} closed, {} tasks cancelled", session_id, cancelled);
        Ok(cancelled)
    }

    /// 立即执行一次清扫（会话过期 + 记忆保留），返回过期的会话
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        self.inner.sweep(now)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.inner.tasks
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.inner.workers
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.inner.workflows
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.inner.memory
    }

    /// 停止后台循环并取消所有 worker
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.workers.shutdown();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!("Background loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Orchestrator shut down");
    }
}

impl Inner {
    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    fn remember(&self, session_id: &str, message: &Message) {
        if let Err(e) = self.memory.put(message.to_record(session_id)) {
            tracing::warn!("Failed to store conversation turn: {}", e);
        }
    }

    fn history(&self, session_id: &str) -> Vec<Message> {
        match self.memory.query(&[CONVERSATION_TAG], session_id) {
            Ok(records) => recent_history(&records, self.config.classifier.history_turns),
            Err(e) => {
                tracing::warn!("Failed to load history for {}: {}", session_id, e);
                Vec::new()
            }
        }
    }

    async fn handle_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<Response, OrchestratorError> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let (session, created) = self.sessions.open(session_id, session_id);
        if created {
            self.events.emit(EventPayload::SessionOpened {
                session_id: session_id.to_string(),
            });
        }
        if session.status == SessionStatus::Paused {
            return Ok(Response::from_error(&OrchestratorError::SessionPaused(
                session_id.to_string(),
            ))
            .with_status(ResponseStatus::SessionPaused));
        }

        let history = self.history(session_id);
        self.remember(session_id, &Message::user(message));

        let active = self.tasks.active_for_session(session_id);
        let session_ctx = SessionContext {
            active_tasks: active
                .iter()
                .map(|t| ActiveTaskSummary {
                    id: t.id.clone(),
                    task_type: t.task_type,
                    status: t.status,
                    description: t.description.clone(),
                })
                .collect(),
        };
        let planning = self.classifier.classify(message, &history, &session_ctx).await;
        let target = planning
            .target_task
            .as_deref()
            .and_then(|id| active.iter().find(|t| t.id == id))
            .or_else(|| active.first());
        let trigger = self.trigger_for(&planning, target, message);
        let decision = self
            .decision
            .decide(&trigger, &planning, &self.workers.load());
        tracing::info!(
            "Session {}: {} trigger, {:?} judgement (confidence {:.2}) -> {:?}",
            session_id,
            trigger.kind(),
            planning.action,
            planning.confidence,
            decision.action
        );

        let response = self
            .act(session_id, message, &history, &planning, &trigger, &decision)
            .await?;
        self.remember(session_id, &Message::assistant(response.text.clone()));
        Ok(response)
    }

    fn trigger_for(&self, planning: &PlanningResult, target: Option<&Task>, message: &str) -> Trigger {
        match target {
            Some(task) if planning.cancellation => Trigger::Cancellation {
                task_id: Some(task.id.clone()),
                task_active: true,
            },
            None if planning.cancellation => Trigger::Cancellation {
                task_id: None,
                task_active: false,
            },
            Some(task) if planning.correction => Trigger::Correction {
                task_id: task.id.clone(),
                worker_running: self.workers.worker_for_task(&task.id).is_some(),
                amended_description: format!(
                    "{}\n\nCorrection from user: {}",
                    task.description,
                    message.trim()
                ),
            },
            _ => Trigger::NewMessage {
                active_task: target.map(|t| t.id.clone()),
            },
        }
    }

    async fn act(
        &self,
        session_id: &str,
        message: &str,
        history: &[Message],
        planning: &PlanningResult,
        trigger: &Trigger,
        decision: &ExecutionDecision,
    ) -> Result<Response, OrchestratorError> {
        match decision.action {
            DecisionAction::Reply => Ok(self.direct_reply(session_id, message, history, planning).await),

            DecisionAction::SpawnWorker | DecisionAction::RequestInfo => match trigger {
                Trigger::Correction {
                    task_id,
                    amended_description,
                    ..
                } if self.workflows.workflow_for_parent(task_id).is_none() => {
                    self.apply_correction(session_id, task_id, amended_description)
                }
                _ => self.launch_new_task(session_id, message, planning, decision).await,
            },

            DecisionAction::AwaitResult => {
                let task_id = decision
                    .target_task
                    .as_deref()
                    .ok_or_else(|| TaskError::NotFound(String::new()))?;
                Ok(self.progress_report(task_id)?)
            }

            DecisionAction::CompleteTask => {
                let task_id = decision
                    .target_task
                    .as_deref()
                    .ok_or_else(|| TaskError::NotFound(String::new()))?;
                if self.cancel_task_tree(task_id)? {
                    let text = decision.message.clone().unwrap_or_else(|| "Task cancelled.".into());
                    Ok(Response::new(text, ResponseStatus::Cancelled).with_task(task_id))
                } else {
                    let status = self.tasks.status(task_id).map(|s| s.to_string()).unwrap_or_default();
                    Ok(Response::new(
                        format!("Task {} had already finished ({}).", task_id, status),
                        ResponseStatus::Replied,
                    )
                    .with_task(task_id))
                }
            }

            DecisionAction::DelegateExternal => {
                let agent = planning.subagent_type.clone().unwrap_or_default();
                self.events.emit(EventPayload::DelegatedExternal {
                    session_id: session_id.to_string(),
                    agent: agent.clone(),
                    description: message.trim().to_string(),
                });
                let text = decision
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Handed off to external agent '{}'.", agent));
                Ok(Response::new(text, ResponseStatus::Delegated))
            }
        }
    }

    async fn direct_reply(
        &self,
        session_id: &str,
        message: &str,
        history: &[Message],
        planning: &PlanningResult,
    ) -> Response {
        if planning.degraded {
            return Response::new(DEGRADED_REPLY, ResponseStatus::Degraded);
        }

        let (system, _) = self.assembler.build(session_id, planning.task_type).await;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system));
        messages.extend(history.iter().cloned());
        messages.push(Message::user(message));

        let llm = &self.config.llm;
        let options = CompletionOptions::new()
            .with_max_tokens(llm.max_tokens)
            .with_temperature(llm.temperature)
            .with_timeout(Duration::from_secs(llm.timeouts.request));
        match complete_with_timeout(self.llm.as_ref(), &messages, &options).await {
            Ok(text) => Response::new(text, ResponseStatus::Replied),
            Err(e) => {
                tracing::warn!("Direct reply failed, answering in degraded mode: {}", e);
                Response::new(DEGRADED_REPLY, ResponseStatus::Degraded)
            }
        }
    }

    fn apply_correction(
        &self,
        session_id: &str,
        task_id: &str,
        amended: &str,
    ) -> Result<Response, OrchestratorError> {
        match self.workers.replace(task_id, amended)? {
            SpawnOutcome::Started(_) => {
                tracing::info!("Session {}: task {} restarted with a correction", session_id, task_id);
                Ok(Response::new(
                    format!("Got it, task {} is restarting with your correction.", task_id),
                    ResponseStatus::Corrected,
                )
                .with_task(task_id))
            }
            SpawnOutcome::Queued { position } => {
                tracing::info!("Session {}: queued task {} amended", session_id, task_id);
                Ok(Response::new(
                    format!(
                        "Updated task {}; it is still queued at position {}.",
                        task_id, position
                    ),
                    ResponseStatus::Queued,
                )
                .with_task(task_id))
            }
        }
    }

    async fn launch_new_task(
        &self,
        session_id: &str,
        message: &str,
        planning: &PlanningResult,
        decision: &ExecutionDecision,
    ) -> Result<Response, OrchestratorError> {
        let skills = self.assembler.expander().expand(
            &planning.skills,
            planning.subagent_type.as_deref(),
            Some(planning.task_type),
        );
        let task = Task::new(session_id, planning.task_type, message.trim())
            .with_skills(skills)
            .with_max_retries(self.config.orchestrator.max_retries);
        let task_id = self.tasks.insert(task)?;
        self.events.emit(EventPayload::TaskCreated {
            task_id: task_id.clone(),
            session_id: session_id.to_string(),
            task_type: planning.task_type,
            description: message.trim().to_string(),
            parent_id: None,
        });

        if decision.multi_step {
            return self.start_workflow(&task_id).await;
        }
        self.dispatch(&task_id, session_id)
    }

    /// 派发到 worker 池；满载时返回排队响应
    fn dispatch(&self, task_id: &str, session_id: &str) -> Result<Response, OrchestratorError> {
        match self.workers.spawn(task_id)? {
            SpawnOutcome::Started(_) => Ok(Response::new(
                format!("On it. Working on task {}.", task_id),
                ResponseStatus::Spawned,
            )
            .with_task(task_id)),
            SpawnOutcome::Queued { position } => {
                tracing::info!("Session {}: task {} waiting for a worker slot", session_id, task_id);
                let backpressure = OrchestratorError::ResourceExhausted { position };
                Ok(Response::new(backpressure.user_message(), ResponseStatus::Queued).with_task(task_id))
            }
        }
    }

    async fn start_workflow(&self, parent_id: &str) -> Result<Response, OrchestratorError> {
        let parent = self
            .tasks
            .get(parent_id)
            .ok_or_else(|| TaskError::NotFound(parent_id.to_string()))?;
        let specs = self.step_planner.plan(&parent.description, parent.task_type).await;

        let name: String = parent.description.chars().take(60).collect();
        let build = |steps: Vec<StepSpec>| {
            WorkflowBuilder::new(name.clone())
                .session_id(parent.session_id.clone())
                .parent_task(parent.id.clone())
                .steps(steps)
                .build()
        };
        let workflow = match build(specs) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("Step plan rejected ({}), falling back to a single step", e);
                build(single_step(&parent.description))?
            }
        };
        let steps: Vec<String> = workflow.steps.iter().map(|s| s.name.clone()).collect();
        let workflow_id = self.workflows.insert(workflow);

        self.tasks.advance_to_running(parent_id)?;
        self.events.emit(EventPayload::WorkflowCreated {
            workflow_id: workflow_id.clone(),
            session_id: parent.session_id.clone(),
            parent_task: parent.id.clone(),
            steps: steps.clone(),
        });
        self.activate_steps(&workflow_id)?;

        Ok(Response::new(
            format!(
                "Planned {} steps for task {}: {}.",
                steps.len(),
                parent_id,
                steps.join(", ")
            ),
            ResponseStatus::Spawned,
        )
        .with_task(parent_id))
    }

    /// 为每个就绪步骤建子任务并派发
    fn activate_steps(&self, workflow_id: &str) -> Result<(), OrchestratorError> {
        let Some(parent) = self
            .workflows
            .get_state(workflow_id)
            .and_then(|w| w.parent_task)
            .and_then(|id| self.tasks.get(&id))
        else {
            return Ok(());
        };

        for step in self.workflows.activate_ready(workflow_id)? {
            let child = Task::new(parent.session_id.clone(), parent.task_type, step.description.clone())
                .with_parent(parent.id.clone())
                .with_priority(parent.priority)
                .with_skills(parent.skills.clone())
                .with_max_retries(parent.max_retries);
            let child_id = self.tasks.insert(child)?;
            self.workflows.bind_task(workflow_id, &step.id, child_id.clone())?;
            self.events.emit(EventPayload::TaskCreated {
                task_id: child_id.clone(),
                session_id: parent.session_id.clone(),
                task_type: parent.task_type,
                description: step.description.clone(),
                parent_id: Some(parent.id.clone()),
            });
            tracing::debug!("Workflow {} step {} -> task {}", workflow_id, step.id, child_id);
            self.dispatch(&child_id, &parent.session_id)?;
        }
        Ok(())
    }

    fn progress_report(&self, task_id: &str) -> Result<Response, OrchestratorError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        let mut text = format!(
            "Task {} is {} ({:.0}% done).",
            task.id,
            task.status,
            task.progress * 100.0
        );
        if let Some(workflow) = self
            .workflows
            .workflow_for_parent(task_id)
            .and_then(|id| self.workflows.get_state(&id))
        {
            let done = workflow
                .steps
                .iter()
                .filter(|s| s.status == TaskStatus::Completed)
                .count();
            text.push_str(&format!(" {}/{} steps done.", done, workflow.steps.len()));
        }
        Ok(Response::new(text, ResponseStatus::Awaiting).with_task(task_id))
    }

    /// 取消任务；若其承载工作流，先取消所有步骤的子任务
    fn cancel_task_tree(&self, task_id: &str) -> Result<bool, OrchestratorError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        if let Some(workflow_id) = self
            .workflows
            .workflow_for_parent(task_id)
            .filter(|id| self.workflows.status(id).is_some_and(|s| !s.is_finished()))
        {
            for child in self.workflows.cancel(&workflow_id)? {
                if self.workers.cancel_task(&child)? {
                    self.events.emit(EventPayload::TaskCancelled {
                        task_id: child,
                        session_id: task.session_id.clone(),
                    });
                }
            }
            self.events.emit(EventPayload::WorkflowFinished {
                workflow_id,
                status: WorkflowStatus::Failed,
            });
        }

        let cancelled = self.workers.cancel_task(task_id)?;
        if cancelled {
            tracing::info!("Task {} cancelled", task_id);
            self.events.emit(EventPayload::TaskCancelled {
                task_id: task_id.to_string(),
                session_id: task.session_id,
            });
        }
        Ok(cancelled)
    }

    fn on_worker_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started {
                worker_id,
                task_id,
                session_id,
                attempt,
            } => self.events.emit(EventPayload::TaskStarted {
                task_id,
                session_id,
                worker_id,
                attempt,
            }),
            WorkerEvent::Progress {
                task_id,
                session_id,
                progress,
                ..
            } => self.events.emit(EventPayload::TaskProgress {
                task_id,
                session_id,
                progress,
            }),
            WorkerEvent::Queued {
                task_id,
                session_id,
                position,
            } => self.events.emit(EventPayload::TaskQueued {
                task_id,
                session_id,
                position,
            }),
            WorkerEvent::Replaced { task_id, session_id } => {
                self.events.emit(EventPayload::TaskCorrected { task_id, session_id })
            }
            WorkerEvent::Finished(report) => self.on_finished(report),
        }
    }

    fn on_finished(&self, report: WorkerReport) {
        if report.discarded {
            tracing::debug!("Result for {} discarded, task already terminal", report.task_id);
            return;
        }
        let Some(task) = self.tasks.get(&report.task_id) else {
            return;
        };

        let trigger = Trigger::WorkerResult {
            task_id: task.id.clone(),
            success: report.outcome.is_success(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            task_cancelled: task.status == TaskStatus::Cancelled,
        };
        let planning = PlanningResult::reply("worker result").with_action(PlanAction::Complete);
        let decision = self.decision.decide(&trigger, &planning, &self.workers.load());

        match (decision.action, decision.task_status) {
            (DecisionAction::CompleteTask, Some(TaskStatus::Completed)) => {
                let result = task.result.clone().unwrap_or_default();
                tracing::info!(
                    "Task {} completed: {} tokens, {} ms (last attempt {:?})",
                    task.id,
                    task.token_usage.total,
                    task.execution_ms,
                    report.elapsed
                );
                self.events.emit(EventPayload::TaskCompleted {
                    task_id: task.id.clone(),
                    session_id: task.session_id.clone(),
                    result: result.clone(),
                    token_usage: task.token_usage,
                    execution_ms: task.execution_ms,
                });
                self.record_result(&task, &result);
                self.settle_step(&task, TaskStatus::Completed, Some(result));
            }
            (DecisionAction::SpawnWorker, _) if decision.retry => self.retry(&task, &report),
            (DecisionAction::CompleteTask, Some(TaskStatus::Failed)) => {
                let error = task
                    .error
                    .clone()
                    .or_else(|| report.outcome.error_summary())
                    .unwrap_or_default();
                self.fail(&task, error);
            }
            (DecisionAction::CompleteTask, Some(TaskStatus::Cancelled)) => {
                self.settle_step(&task, TaskStatus::Cancelled, None);
            }
            (action, status) => {
                tracing::warn!("Unexpected decision for worker result of {}: {:?} {:?}", task.id, action, status);
            }
        }
    }

    fn retry(&self, task: &Task, report: &WorkerReport) {
        let reason = report.outcome.error_summary().unwrap_or_default();
        let attempt = match self.tasks.retry(&task.id) {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::warn!("Retry of {} refused: {}", task.id, e);
                return self.fail(task, reason);
            }
        };
        tracing::info!("Retrying task {} (attempt {}): {}", task.id, attempt, reason);
        self.events.emit(EventPayload::TaskRetrying {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            attempt,
            reason,
        });
        if let Err(e) = self.dispatch(&task.id, &task.session_id) {
            let _ = self.tasks.fail(&task.id, e.to_string());
            self.fail(task, e.to_string());
        }
    }

    fn fail(&self, task: &Task, error: String) {
        tracing::warn!("Task {} failed: {}", task.id, error);
        self.events.emit(EventPayload::TaskFailed {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            error: error.clone(),
        });
        self.settle_step(task, TaskStatus::Failed, Some(error));
    }

    fn record_result(&self, task: &Task, result: &str) {
        let preview: String = result.chars().take(2000).collect();
        let record = MemoryRecord::new(
            task.session_id.clone(),
            format!("Result of task {} ({}): {}", task.id, task.task_type, preview),
        )
        .with_tags([TASK_RESULT_TAG, FACT_TAG, task.task_type.as_str()])
        .with_task(task.id.clone())
        .with_importance(0.6);
        if let Err(e) = self.memory.put(record) {
            tracing::warn!("Failed to store result of {}: {}", task.id, e);
        }
    }

    /// 子任务结束后推进其工作流：全部完成则完成父任务，失败则取消其余步骤并使父任务失败
    fn settle_step(&self, task: &Task, status: TaskStatus, detail: Option<String>) {
        let Some((workflow_id, step_id)) = self.workflows.find_by_task(&task.id) else {
            return;
        };
        let workflow_status = match self.workflows.advance_with(&workflow_id, &step_id, status, detail) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("Step {} of {} not advanced: {}", step_id, workflow_id, e);
                return;
            }
        };
        let Some(workflow) = self.workflows.get_state(&workflow_id) else {
            return;
        };
        let Some(parent_id) = workflow.parent_task.clone() else {
            return;
        };

        match workflow_status {
            WorkflowStatus::Completed => {
                let output = workflow.combined_output();
                self.events.emit(EventPayload::WorkflowFinished {
                    workflow_id,
                    status: workflow_status,
                });
                match self.tasks.complete(&parent_id, output.clone()) {
                    Ok(()) => {
                        if let Some(parent) = self.tasks.get(&parent_id) {
                            let children = self.tasks.children(&parent_id);
                            self.events.emit(EventPayload::TaskCompleted {
                                task_id: parent_id.clone(),
                                session_id: parent.session_id.clone(),
                                result: output.clone(),
                                token_usage: children.iter().map(|c| c.token_usage).sum(),
                                execution_ms: children.iter().map(|c| c.execution_ms).sum(),
                            });
                            self.record_result(&parent, &output);
                        }
                    }
                    Err(e) => tracing::warn!("Could not complete parent {}: {}", parent_id, e),
                }
            }
            WorkflowStatus::Failed => {
                match self.workflows.cancel(&workflow_id) {
                    Ok(leftovers) => {
                        for child in leftovers {
                            let _ = self.workers.cancel_task(&child);
                        }
                    }
                    Err(e) => tracing::warn!("Could not cancel workflow {}: {}", workflow_id, e),
                }
                self.events.emit(EventPayload::WorkflowFinished {
                    workflow_id,
                    status: workflow_status,
                });
                let error = format!("step {} ended as {}", step_id, status);
                if self.tasks.fail(&parent_id, error.clone()).is_ok() {
                    self.events.emit(EventPayload::TaskFailed {
                        task_id: parent_id,
                        session_id: task.session_id.clone(),
                        error,
                    });
                }
            }
            _ => {
                if let Err(e) = self.activate_steps(&workflow_id) {
                    tracing::warn!("Could not activate next steps of {}: {}", workflow_id, e);
                }
            }
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired = self.sessions.sweep_expired(now);
        for session_id in &expired {
            self.events.emit(EventPayload::SessionExpired {
                session_id: session_id.clone(),
            });
        }

        let memory = &self.config.memory;
        let policy = RetentionPolicy::new(
            Duration::from_secs(memory.retention_days.saturating_mul(24 * 3600)),
            memory.min_importance,
        );
        match self.memory.apply_retention(&policy, now) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Retention removed {} memory records", n),
            Err(e) => tracing::warn!("Retention sweep failed: {}", e),
        }
        expired
    }
}

async fn run_reports(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => inner.on_worker_event(event),
                None => break,
            },
        }
    }
    tracing::debug!("Worker report loop stopped");
}

async fn run_sweeper(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.session.sweep_interval());
    // 第一次 tick 立即返回
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.sweep(Utc::now());
            }
        }
    }
    tracing::debug!("Session sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_follows_status() {
        let response = Response::new("On it.", ResponseStatus::SessionPaused).with_task("task_1");
        assert_eq!(response.code, "session_paused");
        assert_eq!(response.task_id.as_deref(), Some("task_1"));
    }

    #[test]
    fn test_error_response_carries_error_code() {
        let response = Response::from_error(&OrchestratorError::ResourceExhausted { position: 2 });
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.code, "queued");
        assert!(response.text.contains("position 2"));
    }
}
