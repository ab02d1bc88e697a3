//! 上下文组装器
//!
//! 固定四层顺序：静态身份材料 → 记忆摘录（标签相关度 + 新近度）→ 技能内容 → 当前任务状态。
//! 超出预算时把记忆层中最旧的一半交给推理后端压缩成一条摘要，再重新组装；
//! 每次 build 至多压缩一次，压缩后仍超预算则对记忆层做确定性截断。
//! 摘要以 `summary` 标签写回 MemoryStore 并记录所替代的记录，被替代的记录不再进入后续上下文。

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ContextSection;
use crate::context::budget::{compression_ratio, TokenEstimator};
use crate::llm::{complete_with_timeout, CompletionOptions, LlmClient};
use crate::memory::{MemoryRecord, MemoryStore, Message, RecordId};
use crate::skills::{SkillError, SkillExpander, SkillResolver};
use crate::tasks::{TaskId, TaskStore, TaskType};

/// 压缩摘要记录的标签
pub const SUMMARY_TAG: &str = "summary";
/// 用户明确陈述的事实
pub const FACT_TAG: &str = "fact";

/// 单次组装请求
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub session_id: String,
    pub task_type: Option<TaskType>,
    /// 请求中显式指定的技能
    pub explicit_skills: Vec<String>,
    pub agent_type: Option<String>,
    /// 当前关注的任务（放在任务状态层最前）
    pub task_id: Option<TaskId>,
}

impl ContextRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.explicit_skills = skills;
        self
    }

    pub fn with_agent_type(mut self, agent_type: Option<String>) -> Self {
        self.agent_type = agent_type;
        self
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// 组装统计（长度单位：估算 token）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextStats {
    pub original_length: usize,
    pub compressed_length: usize,
    /// 1 - compressed/original；未压缩时为 0
    pub compression_ratio: f32,
    pub compressed: bool,
    /// 记忆层条目数（压缩后计摘要为一条）
    pub memory_entries: usize,
    /// 实际加载成功的技能
    pub skills: Vec<String>,
}

pub struct ContextAssembler {
    memory: Arc<dyn MemoryStore>,
    skills: Arc<dyn SkillResolver>,
    expander: SkillExpander,
    llm: Arc<dyn LlmClient>,
    tasks: Arc<TaskStore>,
    static_material: String,
    config: ContextSection,
    summary_timeout: Duration,
}

impl ContextAssembler {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        skills: Arc<dyn SkillResolver>,
        llm: Arc<dyn LlmClient>,
        tasks: Arc<TaskStore>,
    ) -> Self {
        Self {
            memory,
            skills,
            expander: SkillExpander::new(),
            llm,
            tasks,
            static_material: String::new(),
            config: ContextSection::default(),
            summary_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_static_material(mut self, material: impl Into<String>) -> Self {
        self.static_material = material.into();
        self
    }

    pub fn with_expander(mut self, expander: SkillExpander) -> Self {
        self.expander = expander;
        self
    }

    pub fn with_config(mut self, config: ContextSection) -> Self {
        self.config = config;
        self
    }

    pub fn with_summary_timeout(mut self, timeout: Duration) -> Self {
        self.summary_timeout = timeout;
        self
    }

    pub fn expander(&self) -> &SkillExpander {
        &self.expander
    }

    /// 按会话与任务类型组装
    pub async fn build(&self, session_id: &str, task_type: TaskType) -> (String, ContextStats) {
        self.build_with(&ContextRequest::new(session_id).with_task_type(task_type))
            .await
    }

    pub async fn build_with(&self, request: &ContextRequest) -> (String, ContextStats) {
        let excerpts = self.select_memory(request);
        let (skills_layer, loaded_skills) = self.skills_layer(request).await;
        let task_layer = self.task_layer(request);

        let original = self.render(&memory_layer(&excerpts), &skills_layer, &task_layer);
        let original_length = TokenEstimator::estimate(&original);

        let mut stats = ContextStats {
            original_length,
            compressed_length: original_length,
            compression_ratio: 0.0,
            compressed: false,
            memory_entries: excerpts.len(),
            skills: loaded_skills,
        };

        self.touch(&excerpts);

        if original_length <= self.config.budget_tokens || excerpts.is_empty() {
            return (original, stats);
        }

        tracing::debug!(
            "Context for session {} is {} tokens (budget {}), compressing",
            request.session_id,
            original_length,
            self.config.budget_tokens
        );

        let split = (excerpts.len() / 2).max(1);
        let (oldest, rest) = excerpts.split_at(split);
        let summary = self.summarize(&request.session_id, oldest).await;

        let mut kept: Vec<MemoryRecord> = Vec::with_capacity(rest.len() + 1);
        kept.push(summary.clone());
        kept.extend_from_slice(rest);

        let mut memory_text = memory_layer(&kept);
        let mut compressed = self.render(&memory_text, &skills_layer, &task_layer);
        let mut compressed_length = TokenEstimator::estimate(&compressed);

        // 仍超预算：只截断记忆层，不再调用后端
        if compressed_length > self.config.budget_tokens {
            let fixed = TokenEstimator::estimate(&self.render("", &skills_layer, &task_layer))
                + TokenEstimator::estimate("\n\n# Memory\n\n");
            let room = self.config.budget_tokens.saturating_sub(fixed);
            memory_text = TokenEstimator::truncate_to_tokens(&memory_text, room);
            compressed = self.render(&memory_text, &skills_layer, &task_layer);
            compressed_length = TokenEstimator::estimate(&compressed);
        }

        if compressed_length >= original_length {
            tracing::debug!("Compression did not shrink context, keeping original");
            return (original, stats);
        }

        if let Err(e) = self.memory.put(summary) {
            tracing::warn!("Failed to persist context summary: {}", e);
        }

        stats.compressed = true;
        stats.compressed_length = compressed_length;
        stats.compression_ratio = compression_ratio(original_length, compressed_length);
        stats.memory_entries = kept.len();
        tracing::info!(
            "Compressed context for session {}: {} -> {} tokens ({:.0}%)",
            request.session_id,
            original_length,
            compressed_length,
            stats.compression_ratio * 100.0
        );
        (compressed, stats)
    }

    /// 选取记忆摘录：排除已被摘要替代的记录，按 (标签相关度, 新近度) 取前 N 条，再按时间正序排列
    fn select_memory(&self, request: &ContextRequest) -> Vec<MemoryRecord> {
        let records = match self.memory.query(&[], &request.session_id) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Memory query failed for {}: {}", request.session_id, e);
                return Vec::new();
            }
        };

        let superseded: HashSet<&RecordId> =
            records.iter().flat_map(|r| r.supersedes.iter()).collect();

        let mut relevance_tags = vec![SUMMARY_TAG, FACT_TAG];
        if let Some(t) = request.task_type {
            relevance_tags.push(t.as_str());
        }

        let mut candidates: Vec<&MemoryRecord> = records
            .iter()
            .filter(|r| !superseded.contains(&r.id))
            .collect();
        candidates.sort_by(|a, b| {
            b.tag_overlap(&relevance_tags)
                .cmp(&a.tag_overlap(&relevance_tags))
                .then(b.created_at.cmp(&a.created_at))
        });
        candidates.truncate(self.config.memory_excerpts);

        let mut selected: Vec<MemoryRecord> = candidates.into_iter().cloned().collect();
        selected.sort_by_key(|r| r.created_at);
        selected
    }

    fn touch(&self, records: &[MemoryRecord]) {
        if records.is_empty() {
            return;
        }
        let ids: Vec<RecordId> = records.iter().map(|r| r.id.clone()).collect();
        if let Err(e) = self.memory.touch(&ids) {
            tracing::warn!("Failed to record memory access: {}", e);
        }
    }

    async fn skills_layer(&self, request: &ContextRequest) -> (String, Vec<String>) {
        let names = self.expander.expand(
            &request.explicit_skills,
            request.agent_type.as_deref(),
            request.task_type,
        );
        let mut text = String::new();
        let mut loaded = Vec::new();
        for name in names {
            match self.skills.resolve(&name).await {
                Ok(content) => {
                    if !text.is_empty() {
                        text.push_str("\n\n");
                    }
                    text.push_str(content.trim());
                    loaded.push(name);
                }
                Err(SkillError::NotFound(_)) => {
                    tracing::warn!("Skill '{}' not found, skipping", name);
                }
                Err(e) => tracing::warn!("Skill '{}' unavailable: {}", name, e),
            }
        }
        (text, loaded)
    }

    fn task_layer(&self, request: &ContextRequest) -> String {
        let mut tasks = self.tasks.all_active_for_session(&request.session_id);
        tasks.sort_by_key(|t| t.created_at);
        if let Some(focus) = &request.task_id {
            if let Some(task) = self.tasks.get(focus) {
                tasks.retain(|t| &t.id != focus);
                tasks.insert(0, task);
            }
        }

        let mut text = String::new();
        for task in tasks {
            let _ = writeln!(
                text,
                "- [{}] {} ({}, {:.0}%): {}",
                task.status,
                task.id,
                task.task_type,
                task.progress * 100.0,
                task.description
            );
        }
        text
    }

    fn render(&self, memory: &str, skills: &str, tasks: &str) -> String {
        let layers = [
            ("Identity", self.static_material.as_str()),
            ("Memory", memory),
            ("Skills", skills),
            ("Task State", tasks),
        ];
        let mut out = String::new();
        for (title, body) in layers {
            let body = body.trim();
            if body.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            let _ = write!(out, "# {}\n\n{}", title, body);
        }
        out
    }

    /// 把最旧的若干条记忆压缩为一条摘要；后端失败时用截断摘要代替
    async fn summarize(&self, session_id: &str, oldest: &[MemoryRecord]) -> MemoryRecord {
        let joined = oldest
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let messages = vec![
            Message::system(
                "Summarize the following notes into one short paragraph. \
                 Keep facts, decisions, names and open questions. Reply with the summary only.",
            ),
            Message::user(joined.clone()),
        ];
        let options = CompletionOptions::new()
            .with_max_tokens(self.config.summary_max_tokens)
            .with_timeout(self.summary_timeout);

        let content = match complete_with_timeout(self.llm.as_ref(), &messages, &options).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => digest(oldest, self.config.summary_max_tokens as usize),
            Err(e) => {
                tracing::warn!("Summary backend failed ({}), using truncation digest", e);
                digest(oldest, self.config.summary_max_tokens as usize)
            }
        };

        let importance = oldest
            .iter()
            .map(|r| r.importance)
            .fold(0.0f32, f32::max);
        let mut record = MemoryRecord::new(session_id, content)
            .with_tags([SUMMARY_TAG])
            .with_importance(importance.max(0.5))
            .superseding(oldest.iter().map(|r| r.id.clone()).collect());
        // 摘要占据被替代记录中最晚的位置，保证时间顺序不乱
        if let Some(last) = oldest.last() {
            record = record.with_created_at(last.created_at);
        }
        record
    }
}

fn memory_layer(records: &[MemoryRecord]) -> String {
    let mut text = String::new();
    for r in records {
        let tags: Vec<&str> = r.tags.iter().map(String::as_str).collect();
        let _ = writeln!(
            text,
            "- [{}] ({}) {}",
            r.created_at.format("%Y-%m-%d %H:%M"),
            tags.join(","),
            r.content
        );
    }
    text
}

/// 确定性截断摘要：每条取开头，整体不超过 max_tokens
fn digest(records: &[MemoryRecord], max_tokens: usize) -> String {
    let per_record = (max_tokens / records.len().max(1)).max(8);
    let parts: Vec<String> = records
        .iter()
        .map(|r| TokenEstimator::truncate_to_tokens(r.content.trim(), per_record))
        .collect();
    TokenEstimator::truncate_to_tokens(&format!("Earlier notes: {}", parts.join(" | ")), max_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::InMemoryMemoryStore;
    use crate::skills::StaticSkillResolver;
    use crate::tasks::Task;
    use chrono::{Duration as ChronoDuration, Utc};
    use proptest::prelude::*;

    struct Fixture {
        memory: Arc<InMemoryMemoryStore>,
        tasks: Arc<TaskStore>,
    }

    fn fixture() -> Fixture {
        Fixture {
            memory: Arc::new(InMemoryMemoryStore::new()),
            tasks: Arc::new(TaskStore::new()),
        }
    }

    fn assembler(f: &Fixture, llm: ScriptedLlmClient, budget: usize) -> ContextAssembler {
        let skills = StaticSkillResolver::new()
            .with_skill("pytest", "Use pytest fixtures.")
            .with_skill("house-style", "Keep answers short.");
        ContextAssembler::new(f.memory.clone(), Arc::new(skills), Arc::new(llm), f.tasks.clone())
            .with_static_material("You are Hive.")
            .with_expander(
                SkillExpander::new()
                    .with_defaults(vec!["house-style".into(), "missing-skill".into()])
                    .map_task_type(TaskType::Testing, vec!["pytest".into()]),
            )
            .with_config(ContextSection {
                budget_tokens: budget,
                memory_excerpts: 12,
                summary_max_tokens: 64,
            })
    }

    fn seed(memory: &InMemoryMemoryStore, n: usize, words: usize) {
        let base = Utc::now() - ChronoDuration::hours(n as i64);
        for i in 0..n {
            let content = format!("note {i}: {}", "lorem ipsum dolor ".repeat(words));
            memory
                .put(
                    MemoryRecord::new("s1", content)
                        .with_created_at(base + ChronoDuration::minutes(i as i64)),
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_layers_are_in_fixed_order() {
        let f = fixture();
        seed(&f.memory, 2, 1);
        f.tasks
            .insert(Task::new("s1", TaskType::Testing, "add login tests"))
            .unwrap();
        let a = assembler(&f, ScriptedLlmClient::new(vec![]), 10_000);

        let (text, stats) = a.build("s1", TaskType::Testing).await;
        let pos = |needle: &str| text.find(needle).unwrap();
        assert!(pos("# Identity") < pos("# Memory"));
        assert!(pos("# Memory") < pos("# Skills"));
        assert!(pos("# Skills") < pos("# Task State"));
        assert!(text.contains("add login tests"));
        assert!(!stats.compressed);
        assert_eq!(stats.compression_ratio, 0.0);
        assert_eq!(stats.compressed_length, stats.original_length);
        // 缺失技能被跳过
        assert_eq!(stats.skills, vec!["pytest".to_string(), "house-style".to_string()]);
    }

    #[tokio::test]
    async fn test_compression_summarizes_oldest_half_once() {
        let f = fixture();
        seed(&f.memory, 8, 40);
        let llm = ScriptedLlmClient::always(Ok("condensed history".to_string()));
        let a = assembler(&f, llm, 400);

        let (text, stats) = a.build("s1", TaskType::Analysis).await;
        assert!(stats.compressed);
        assert!(stats.compressed_length < stats.original_length);
        assert!(stats.compression_ratio > 0.0 && stats.compression_ratio <= 1.0);
        assert!(text.contains("condensed history"));
        assert_eq!(stats.memory_entries, 5);

        let summaries = f.memory.query(&[SUMMARY_TAG], "s1").unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].supersedes.len(), 4);
    }

    #[tokio::test]
    async fn test_superseded_records_are_excluded_next_time() {
        let f = fixture();
        seed(&f.memory, 8, 40);
        let a = assembler(
            &f,
            ScriptedLlmClient::always(Ok("condensed history".to_string())),
            400,
        );
        a.build("s1", TaskType::Analysis).await;

        let big = assembler(&f, ScriptedLlmClient::new(vec![]), 100_000);
        let (text, stats) = big.build("s1", TaskType::Analysis).await;
        assert!(!text.contains("note 0:"));
        assert!(text.contains("note 7:"));
        assert!(text.contains("condensed history"));
        assert_eq!(stats.memory_entries, 5);
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back_to_digest() {
        let f = fixture();
        seed(&f.memory, 6, 40);
        let llm = ScriptedLlmClient::always(Err(LlmError::Unavailable("down".into())));
        let a = assembler(&f, llm, 300);

        let (text, stats) = a.build("s1", TaskType::Analysis).await;
        assert!(stats.compressed);
        assert!(text.contains("Earlier notes:"));
        assert!(stats.compressed_length <= 300);
    }

    #[tokio::test]
    async fn test_relevant_tags_win_over_recency() {
        let f = fixture();
        seed(&f.memory, 20, 1);
        let old = Utc::now() - ChronoDuration::days(3);
        f.memory
            .put(
                MemoryRecord::new("s1", "user prefers pytest")
                    .with_tags([FACT_TAG])
                    .with_created_at(old),
            )
            .unwrap();
        let a = assembler(&f, ScriptedLlmClient::new(vec![]), 100_000);
        let (text, stats) = a.build("s1", TaskType::Testing).await;
        assert_eq!(stats.memory_entries, 12);
        assert!(text.contains("user prefers pytest"));
        assert!(!text.contains("note 0:"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_compression_stats_are_bounded(
            notes in prop::collection::vec("[a-z ]{0,200}", 0..16),
            budget in 1usize..600,
            summary in "[a-z ]{0,400}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let stats = rt.block_on(async {
                let f = fixture();
                for n in &notes {
                    f.memory.put(MemoryRecord::new("s1", n.clone())).unwrap();
                }
                let a = assembler(&f, ScriptedLlmClient::always(Ok(summary.clone())), budget);
                a.build("s1", TaskType::Other).await.1
            });
            prop_assert!(stats.compressed_length <= stats.original_length);
            prop_assert!((0.0..=1.0).contains(&stats.compression_ratio));
            if !stats.compressed {
                prop_assert_eq!(stats.compression_ratio, 0.0);
            }
        }
    }
}
