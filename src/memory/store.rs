//! 记忆存储：put / query(tags, session) 的逻辑契约与内存实现
//!
//! 写入以追加为主，不需要跨记录加锁；保留策略（年龄 + 低重要度）是唯一的结构性删除途径。

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::memory::{MemoryRecord, RecordId};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory record (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Memory store lock poisoned")]
    LockPoisoned,
}

/// 保留策略：创建时间早于 max_age 且重要度低于 min_importance 的记录会被清理
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub min_importance: f32,
}

impl RetentionPolicy {
    pub fn new(max_age: Duration, min_importance: f32) -> Self {
        Self {
            max_age,
            min_importance,
        }
    }

    pub fn expires(&self, record: &MemoryRecord, now: DateTime<Utc>) -> bool {
        let age = now
            .signed_duration_since(record.created_at)
            .to_std()
            .unwrap_or_default();
        age > self.max_age && record.importance < self.min_importance
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 24 * 3600), 0.2)
    }
}

/// 记忆存储 trait
pub trait MemoryStore: Send + Sync {
    /// 追加一条记录（同 ID 视为更新）
    fn put(&self, record: MemoryRecord) -> Result<(), MemoryError>;

    /// 按会话查询：tags 为空时返回该会话全部记录，否则返回带任一标签的记录；按创建时间正序
    fn query(&self, tags: &[&str], session_id: &str) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// 记录一次访问（accessed_at / access_count）
    fn touch(&self, ids: &[RecordId]) -> Result<(), MemoryError>;

    fn set_importance(&self, id: &str, importance: f32) -> Result<(), MemoryError>;

    /// 执行保留策略，返回删除条数
    fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, MemoryError>;
}

/// 记录集合上的公共操作，内存实现与文件实现共用
#[derive(Debug, Default)]
pub(crate) struct RecordSet {
    records: Vec<MemoryRecord>,
}

impl RecordSet {
    pub(crate) fn from_records(records: Vec<MemoryRecord>) -> Self {
        let mut set = Self::default();
        for r in records {
            set.upsert(r);
        }
        set
    }

    pub(crate) fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    /// 返回 true 表示新追加，false 表示替换了已有记录
    pub(crate) fn upsert(&mut self, record: MemoryRecord) -> bool {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                self.records.push(record);
                true
            }
        }
    }

    pub(crate) fn query(&self, tags: &[&str], session_id: &str) -> Vec<MemoryRecord> {
        let mut hits: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|r| r.session_id == session_id)
            .filter(|r| tags.is_empty() || r.tag_overlap(tags) > 0)
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.created_at);
        hits
    }

    pub(crate) fn touch(&mut self, ids: &[RecordId], now: DateTime<Utc>) -> usize {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut touched = 0;
        for r in self.records.iter_mut().filter(|r| wanted.contains(r.id.as_str())) {
            r.mark_accessed(now);
            touched += 1;
        }
        touched
    }

    pub(crate) fn set_importance(&mut self, id: &str, importance: f32) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(r) => {
                r.importance = importance.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    pub(crate) fn retain(&mut self, policy: &RetentionPolicy, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !policy.expires(r, now));
        before - self.records.len()
    }
}

/// 内存实现（测试与无持久化部署）
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    inner: RwLock<RecordSet>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|s| s.records().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RecordSet>, MemoryError> {
        self.inner.read().map_err(|_| MemoryError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RecordSet>, MemoryError> {
        self.inner.write().map_err(|_| MemoryError::LockPoisoned)
    }
}

impl MemoryStore for InMemoryMemoryStore {
    fn put(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        self.write()?.upsert(record);
        Ok(())
    }

    fn query(&self, tags: &[&str], session_id: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self.read()?.query(tags, session_id))
    }

    fn touch(&self, ids: &[RecordId]) -> Result<(), MemoryError> {
        self.write()?.touch(ids, Utc::now());
        Ok(())
    }

    fn set_importance(&self, id: &str, importance: f32) -> Result<(), MemoryError> {
        self.write()?.set_importance(id, importance);
        Ok(())
    }

    fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, MemoryError> {
        Ok(self.write()?.retain(policy, now))
    }
}
