//! Worker 池性质测试：多个并发提交方随机交错 spawn / cancel / replace，
//! 并发数始终不超过上限，且所有任务最终进入终态

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::tasks::{Task, TaskPriority, TaskStatus, TaskStore, TaskType};
use hive::worker::{Worker, WorkerContext, WorkerError, WorkerManager, WorkerOutput, WorkerTask};
use proptest::prelude::*;

/// 按描述开头的毫秒数休眠
struct SleepyWorker;

#[async_trait]
impl Worker for SleepyWorker {
    async fn execute(
        &self,
        task: WorkerTask,
        mut ctx: WorkerContext,
    ) -> Result<WorkerOutput, WorkerError> {
        let millis: u64 = task
            .description
            .split_whitespace()
            .next()
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
            _ = ctx.cancelled() => return Err(WorkerError::Cancelled),
        }
        ctx.checkpoint().await?;
        Ok(WorkerOutput::new(task.description))
    }
}

#[derive(Debug, Clone, Copy)]
enum Followup {
    None,
    Cancel,
    Replace,
}

fn priority(raw: u8) -> TaskPriority {
    match raw % 3 {
        0 => TaskPriority::Low,
        1 => TaskPriority::Normal,
        _ => TaskPriority::High,
    }
}

fn followup() -> impl Strategy<Value = Followup> {
    prop_oneof![
        3 => Just(Followup::None),
        1 => Just(Followup::Cancel),
        1 => Just(Followup::Replace),
    ]
}

/// 一个提交方：依次提交自己的任务，每个任务可在随机延迟后被取消或改写
async fn submitter(
    manager: Arc<WorkerManager>,
    tasks: Arc<TaskStore>,
    jobs: Vec<(u64, u8, Followup, u64)>,
) -> Vec<String> {
    let mut ids = Vec::new();
    for (millis, raw_priority, follow, wait) in jobs {
        let task = Task::new("s1", TaskType::Other, millis.to_string())
            .with_priority(priority(raw_priority));
        let id = tasks.insert(task).unwrap();
        manager.spawn(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(wait)).await;
        match follow {
            Followup::None => {}
            Followup::Cancel => {
                let _ = manager.cancel_task(&id);
            }
            // 已结束的任务不接受改写，忽略错误
            Followup::Replace => {
                let _ = manager.replace(&id, format!("{} revised", millis));
            }
        }
        ids.push(id);
    }
    ids
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_peak_never_exceeds_limit_under_concurrent_load(
        max in 1usize..4,
        lanes in prop::collection::vec(
            prop::collection::vec((0u64..6, any::<u8>(), followup(), 0u64..4), 1..5),
            2..5,
        ),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (peak, statuses, queued) = runtime.block_on(async {
            let tasks = Arc::new(TaskStore::new());
            let (manager, _events) = WorkerManager::new(
                Arc::new(SleepyWorker),
                Arc::clone(&tasks),
                max,
                Duration::from_secs(5),
            );

            let handles: Vec<_> = lanes
                .iter()
                .cloned()
                .map(|jobs| tokio::spawn(submitter(Arc::clone(&manager), Arc::clone(&tasks), jobs)))
                .collect();
            let mut ids = Vec::new();
            for handle in handles {
                ids.extend(handle.await.unwrap());
            }

            for _ in 0..500 {
                if ids
                    .iter()
                    .all(|id| tasks.status(id).is_some_and(|s| s.is_terminal()))
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let statuses: Vec<Option<TaskStatus>> = ids.iter().map(|id| tasks.status(id)).collect();
            (manager.peak_active(), statuses, manager.load().queued)
        });

        prop_assert!(peak <= max, "peak {} exceeded limit {}", peak, max);
        prop_assert!(peak >= 1);
        prop_assert_eq!(queued, 0);
        prop_assert!(
            statuses
                .iter()
                .all(|s| matches!(s, Some(TaskStatus::Completed | TaskStatus::Cancelled))),
            "non-terminal tasks left: {:?}",
            statuses
        );
    }
}
