//! 任务仓库：以 ID 索引的 Task arena
//!
//! 父子关系只存 ID，不持有引用；插入时校验父任务存在且祖先链无环。
//! 所有状态变更都经过 [`TaskStatus::can_transition_to`]，终态一旦写入便不可再改。

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use crate::llm::TokenCount;
use crate::tasks::{Task, TaskError, TaskId, TaskStatus};

#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    // 锁内只做内存操作，中毒时直接接管数据
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 插入新任务；任务必须处于 PENDING
    pub fn insert(&self, task: Task) -> Result<TaskId, TaskError> {
        let mut tasks = self.write();
        if tasks.contains_key(&task.id) {
            return Err(TaskError::Duplicate(task.id));
        }
        if let Some(parent) = &task.parent_id {
            if !tasks.contains_key(parent) {
                return Err(TaskError::UnknownParent(parent.clone()));
            }
            // 沿祖先链上溯；遇到自身或重复节点即为环
            let mut seen = vec![task.id.clone()];
            let mut cursor = Some(parent.clone());
            while let Some(id) = cursor {
                if seen.contains(&id) {
                    return Err(TaskError::CyclicParent(task.id));
                }
                cursor = tasks.get(&id).and_then(|t| t.parent_id.clone());
                seen.push(id);
            }
        }
        let id = task.id.clone();
        tasks.insert(id.clone(), task);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.read().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.read().get(id).map(|t| t.status)
    }

    /// 沿状态机迁移；返回迁移前的状态
    pub fn transition(&self, id: &str, next: TaskStatus) -> Result<TaskStatus, TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        apply_transition(task, next)
    }

    /// 把任务从当前状态推进到 RUNNING（沿途经过 PLANNED / ASSIGNED）
    pub fn advance_to_running(&self, id: &str) -> Result<(), TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        loop {
            let next = match task.status {
                TaskStatus::Pending => TaskStatus::Planned,
                TaskStatus::Planned => TaskStatus::Assigned,
                TaskStatus::Assigned => TaskStatus::Running,
                TaskStatus::Running => return Ok(()),
                from => {
                    return Err(TaskError::InvalidTransition {
                        id: id.to_string(),
                        from,
                        to: TaskStatus::Running,
                    })
                }
            };
            apply_transition(task, next)?;
        }
    }

    /// RUNNING 期间更新进度；进度只增不减，返回生效后的值
    pub fn update_progress(&self, id: &str, progress: f32) -> Result<f32, TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.status == TaskStatus::Running {
            let clamped = progress.clamp(0.0, 1.0);
            if clamped > task.progress {
                task.progress = clamped;
                task.updated_at = Utc::now();
            }
        }
        Ok(task.progress)
    }

    /// 累加一次尝试的用量与耗时；不涉及状态迁移，终态任务同样记账
    pub fn record_execution(
        &self,
        id: &str,
        usage: Option<TokenCount>,
        elapsed: Duration,
    ) -> Result<(), TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if let Some(usage) = usage {
            task.token_usage += usage;
        }
        task.execution_ms = task
            .execution_ms
            .saturating_add(elapsed.as_millis().min(u64::MAX as u128) as u64);
        Ok(())
    }

    /// RUNNING → COMPLETED 并写入结果
    pub fn complete(&self, id: &str, result: impl Into<String>) -> Result<(), TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        apply_transition(task, TaskStatus::Completed)?;
        task.progress = 1.0;
        task.result = Some(result.into());
        Ok(())
    }

    /// 非终态 → FAILED 并记录错误。RUNNING 之前的失败（如无法执行）也允许直接落到 FAILED
    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<(), TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Running {
            if task.status.is_terminal() {
                return Err(TaskError::InvalidTransition {
                    id: id.to_string(),
                    from: task.status,
                    to: TaskStatus::Failed,
                });
            }
            // 先补齐到 RUNNING，保持只沿状态机边迁移
            while task.status != TaskStatus::Running {
                let next = match task.status {
                    TaskStatus::Pending => TaskStatus::Planned,
                    TaskStatus::Planned => TaskStatus::Assigned,
                    _ => TaskStatus::Running,
                };
                apply_transition(task, next)?;
            }
        }
        apply_transition(task, TaskStatus::Failed)?;
        task.error = Some(error.into());
        Ok(())
    }

    /// 非终态 → CANCELLED；已是终态时返回 false（不视为错误）
    pub fn cancel(&self, id: &str) -> Result<bool, TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        apply_transition(task, TaskStatus::Cancelled)?;
        Ok(true)
    }

    /// FAILED → ASSIGNED，retry_count + 1；预算耗尽时拒绝
    pub fn retry(&self, id: &str) -> Result<u32, TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.status == TaskStatus::Failed && !task.retry_budget_left() {
            return Err(TaskError::RetryBudgetExhausted(id.to_string()));
        }
        apply_transition(task, TaskStatus::Assigned)?;
        task.retry_count += 1;
        task.error = None;
        Ok(task.retry_count)
    }

    /// 修改描述（纠正后的重新规划），不改变状态与重试计数
    pub fn amend_description(&self, id: &str, description: impl Into<String>) -> Result<(), TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.status.is_terminal() {
            return Err(TaskError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: task.status,
            });
        }
        task.description = description.into();
        task.updated_at = Utc::now();
        Ok(())
    }

    /// 会话内的非终态顶层任务，按创建时间倒序（最近的在前）
    pub fn active_for_session(&self, session_id: &str) -> Vec<Task> {
        let mut active: Vec<Task> = self
            .read()
            .values()
            .filter(|t| t.session_id == session_id && !t.is_terminal() && t.parent_id.is_none())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        active
    }

    /// 会话内所有非终态任务（含子任务）
    pub fn all_active_for_session(&self, session_id: &str) -> Vec<Task> {
        self.read()
            .values()
            .filter(|t| t.session_id == session_id && !t.is_terminal())
            .cloned()
            .collect()
    }

    pub fn children(&self, parent_id: &str) -> Vec<Task> {
        let mut children: Vec<Task> = self
            .read()
            .values()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|t| t.created_at);
        children
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn apply_transition(task: &mut Task, next: TaskStatus) -> Result<TaskStatus, TaskError> {
    let from = task.status;
    if !from.can_transition_to(next) {
        return Err(TaskError::InvalidTransition {
            id: task.id.clone(),
            from,
            to: next,
        });
    }
    let now = Utc::now();
    task.status = next;
    task.updated_at = now;
    task.completed_at = if next.is_terminal() { Some(now) } else { None };
    tracing::debug!("Task {} {} -> {}", task.id, from, next);
    Ok(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskType;

    fn new_task(store: &TaskStore) -> TaskId {
        store
            .insert(Task::new("s1", TaskType::CodeGeneration, "write a parser").with_max_retries(1))
            .unwrap()
    }

    #[test]
    fn test_full_lifecycle_sets_completed_at_only_when_terminal() {
        let store = TaskStore::new();
        let id = new_task(&store);
        store.advance_to_running(&id).unwrap();
        assert!(store.get(&id).unwrap().completed_at.is_none());

        store.complete(&id, "done").unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.as_deref(), Some("done"));
    }

    #[test]
    fn test_execution_record_accumulates_across_attempts() {
        let store = TaskStore::new();
        let id = new_task(&store);
        store
            .record_execution(&id, Some(TokenCount::new(10, 5)), Duration::from_millis(120))
            .unwrap();
        store.record_execution(&id, None, Duration::from_millis(30)).unwrap();
        store
            .record_execution(&id, Some(TokenCount::new(1, 1)), Duration::ZERO)
            .unwrap();

        let task = store.get(&id).unwrap();
        assert_eq!(task.token_usage, TokenCount::new(11, 6));
        assert_eq!(task.token_usage.total, 17);
        assert_eq!(task.execution_ms, 150);
        assert!(store.record_execution("missing", None, Duration::ZERO).is_err());
    }

    #[test]
    fn test_complete_requires_running() {
        let store = TaskStore::new();
        let id = new_task(&store);
        let err = store.complete(&id, "too early").unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[test]
    fn test_progress_is_monotonic_while_running() {
        let store = TaskStore::new();
        let id = new_task(&store);
        store.advance_to_running(&id).unwrap();
        assert_eq!(store.update_progress(&id, 0.6).unwrap(), 0.6);
        assert_eq!(store.update_progress(&id, 0.2).unwrap(), 0.6);
        assert_eq!(store.update_progress(&id, 7.0).unwrap(), 1.0);
    }

    #[test]
    fn test_retry_respects_budget() {
        let store = TaskStore::new();
        let id = new_task(&store);
        store.advance_to_running(&id).unwrap();
        store.fail(&id, "boom").unwrap();
        assert!(store.get(&id).unwrap().completed_at.is_some());

        assert_eq!(store.retry(&id).unwrap(), 1);
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert!(task.completed_at.is_none());

        store.advance_to_running(&id).unwrap();
        store.fail(&id, "boom again").unwrap();
        assert_eq!(
            store.retry(&id),
            Err(TaskError::RetryBudgetExhausted(id.clone()))
        );
    }

    #[test]
    fn test_cancel_from_pending_and_terminal_is_noop() {
        let store = TaskStore::new();
        let id = new_task(&store);
        assert!(store.cancel(&id).unwrap());
        assert!(!store.cancel(&id).unwrap());
        assert!(store.advance_to_running(&id).is_err());
    }

    #[test]
    fn test_parent_must_exist() {
        let store = TaskStore::new();
        let orphan = Task::new("s1", TaskType::Other, "x").with_parent("task_missing");
        assert!(matches!(store.insert(orphan), Err(TaskError::UnknownParent(_))));
    }

    #[test]
    fn test_children_and_active_listing() {
        let store = TaskStore::new();
        let parent = new_task(&store);
        let child = store
            .insert(Task::new("s1", TaskType::Testing, "add tests").with_parent(parent.clone()))
            .unwrap();
        assert_eq!(store.children(&parent).len(), 1);
        // 子任务不出现在顶层活跃列表
        let active: Vec<TaskId> = store
            .active_for_session("s1")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(active, vec![parent]);
        assert_eq!(store.all_active_for_session("s1").len(), 2);
        assert!(store.active_for_session("s2").is_empty());
        assert!(store.get(&child).is_some());
    }
}
