//! 记忆记录：带标签、重要度与访问统计的持久事实 / 摘要

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::TaskId;

pub type RecordId = String;

/// 单条记忆记录；结构上只追加，仅 importance 与访问统计可更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub session_id: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// 重要度 [0, 1]
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    /// 压缩摘要所替代的记录 ID；被替代的记录不再进入上下文
    #[serde(default)]
    pub supersedes: Vec<RecordId>,
}

impl MemoryRecord {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("mem_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            task_id: None,
            content: content.into(),
            tags: BTreeSet::new(),
            importance: 0.5,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            supersedes: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.accessed_at = at;
        self
    }

    pub fn superseding(mut self, ids: Vec<RecordId>) -> Self {
        self.supersedes = ids;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// 与给定标签集合的重合数（标签相关度）
    pub fn tag_overlap(&self, tags: &[&str]) -> usize {
        tags.iter().filter(|t| self.tags.contains(**t)).count()
    }

    pub(crate) fn mark_accessed(&mut self, at: DateTime<Utc>) {
        self.accessed_at = at;
        self.access_count += 1;
    }
}
