//! 文件持久化的记忆存储
//!
//! JSON Lines：每行一条 MemoryRecord，打开时全量加载，同 ID 以最后一行为准。
//! put 与访问统计 / 重要度更新都只追加变更记录的新版本并 sync_data；
//! 过期行累计超过存活记录数（且不少于 COMPACT_FLOOR）时整体压缩重写，保留清理也会重写。

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::memory::store::RecordSet;
use crate::memory::{MemoryError, MemoryRecord, MemoryStore, RecordId, RetentionPolicy};

/// 触发压缩的最少过期行数
const COMPACT_FLOOR: usize = 64;

#[derive(Debug)]
struct JsonlState {
    set: RecordSet,
    /// 文件中已被同 ID 后续行覆盖的行数
    stale_lines: usize,
}

#[derive(Debug)]
pub struct JsonlMemoryStore {
    path: PathBuf,
    inner: Mutex<JsonlState>,
}

impl JsonlMemoryStore {
    /// 打开（不存在则创建）存储文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lines = if path.exists() {
            Self::load(&path)?
        } else {
            Vec::new()
        };
        let total = lines.len();
        let set = RecordSet::from_records(lines);
        let stale_lines = total - set.records().len();
        tracing::debug!(
            "Loaded {} memory records from {} ({} stale lines)",
            set.records().len(),
            path.display(),
            stale_lines
        );
        Ok(Self {
            path,
            inner: Mutex::new(JsonlState { set, stale_lines }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Vec<MemoryRecord>, MemoryError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryRecord>(&line) {
                Ok(r) => records.push(r),
                // 进程在写一半时退出只会损坏最后一行
                Err(e) => tracing::warn!("Skipping corrupt memory line in {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    fn lock(&self) -> Result<MutexGuard<'_, JsonlState>, MemoryError> {
        self.inner.lock().map_err(|_| MemoryError::LockPoisoned)
    }

    /// 一次打开、一次 sync 追加多行
    fn append<'a>(&self, records: impl IntoIterator<Item = &'a MemoryRecord>) -> Result<usize, MemoryError> {
        let mut buf = String::new();
        let mut count = 0;
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
            count += 1;
        }
        if count == 0 {
            return Ok(0);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        Ok(count)
    }

    /// 先写临时文件再 rename，避免重写中途崩溃丢数据
    fn rewrite(&self, set: &RecordSet) -> Result<(), MemoryError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for r in set.records() {
                let mut line = serde_json::to_string(r)?;
                line.push('\n');
                file.write_all(line.as_bytes())?;
            }
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// 追加了覆盖行之后调用：过期行足够多时压缩
    fn superseded(&self, state: &mut JsonlState, lines: usize) -> Result<(), MemoryError> {
        state.stale_lines += lines;
        if state.stale_lines > state.set.records().len().max(COMPACT_FLOOR) {
            self.rewrite(&state.set)?;
            tracing::debug!(
                "Compacted {} ({} stale lines dropped)",
                self.path.display(),
                state.stale_lines
            );
            state.stale_lines = 0;
        }
        Ok(())
    }
}

impl MemoryStore for JsonlMemoryStore {
    fn put(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        let mut state = self.lock()?;
        self.append([&record])?;
        if !state.set.upsert(record) {
            self.superseded(&mut state, 1)?;
        }
        Ok(())
    }

    fn query(&self, tags: &[&str], session_id: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self.lock()?.set.query(tags, session_id))
    }

    fn touch(&self, ids: &[RecordId]) -> Result<(), MemoryError> {
        let mut state = self.lock()?;
        if state.set.touch(ids, Utc::now()) == 0 {
            return Ok(());
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let written = self.append(
            state
                .set
                .records()
                .iter()
                .filter(|r| wanted.contains(r.id.as_str())),
        )?;
        self.superseded(&mut state, written)
    }

    fn set_importance(&self, id: &str, importance: f32) -> Result<(), MemoryError> {
        let mut state = self.lock()?;
        if !state.set.set_importance(id, importance) {
            return Ok(());
        }
        let written = self.append(state.set.records().iter().filter(|r| r.id == id))?;
        self.superseded(&mut state, written)
    }

    fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, MemoryError> {
        let mut state = self.lock()?;
        let removed = state.set.retain(policy, now);
        if removed > 0 || state.stale_lines > 0 {
            self.rewrite(&state.set)?;
            state.stale_lines = 0;
        }
        if removed > 0 {
            tracing::info!("Retention removed {} memory records", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory/records.jsonl");

        let rec = MemoryRecord::new("s1", "deploys happen on fridays").with_tags(["fact"]);
        let id = rec.id.clone();
        {
            let store = JsonlMemoryStore::open(&path).unwrap();
            store.put(rec).unwrap();
            store.set_importance(&id, 0.9).unwrap();
        }

        let reopened = JsonlMemoryStore::open(&path).unwrap();
        let facts = reopened.query(&["fact"], "s1").unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "deploys happen on fridays");
        assert!((facts[0].importance - 0.9).abs() < f32::EPSILON);
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count()
    }

    #[test]
    fn test_touch_appends_only_touched_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let store = JsonlMemoryStore::open(&path).unwrap();
        let ids: Vec<RecordId> = (0..10)
            .map(|i| {
                let rec = MemoryRecord::new("s1", format!("note {i}"));
                let id = rec.id.clone();
                store.put(rec).unwrap();
                id
            })
            .collect();
        assert_eq!(line_count(&path), 10);

        store.touch(&ids[..2]).unwrap();
        store.touch(&ids[..1]).unwrap();
        assert_eq!(line_count(&path), 13);

        let reopened = JsonlMemoryStore::open(&path).unwrap();
        let records = reopened.query(&[], "s1").unwrap();
        assert_eq!(records.len(), 10);
        let first = records.iter().find(|r| r.id == ids[0]).unwrap();
        assert_eq!(first.access_count, 2);
        assert_eq!(reopened.lock().unwrap().stale_lines, 3);
    }

    #[test]
    fn test_stale_lines_trigger_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let store = JsonlMemoryStore::open(&path).unwrap();
        let rec = MemoryRecord::new("s1", "hot record");
        let id = rec.id.clone();
        store.put(rec).unwrap();

        for _ in 0..COMPACT_FLOOR {
            store.touch(std::slice::from_ref(&id)).unwrap();
        }
        assert_eq!(line_count(&path), COMPACT_FLOOR + 1);

        store.touch(std::slice::from_ref(&id)).unwrap();
        assert_eq!(line_count(&path), 1);
        let reopened = JsonlMemoryStore::open(&path).unwrap();
        assert_eq!(
            reopened.query(&[], "s1").unwrap()[0].access_count,
            COMPACT_FLOOR as u64 + 1
        );
    }

    #[test]
    fn test_corrupt_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        {
            let store = JsonlMemoryStore::open(&path).unwrap();
            store.put(MemoryRecord::new("s1", "ok")).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"id\": \"half").unwrap();

        let store = JsonlMemoryStore::open(&path).unwrap();
        assert_eq!(store.query(&[], "s1").unwrap().len(), 1);
    }
}
