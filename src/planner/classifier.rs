//! 任务分类器：消息 + 历史 + 会话上下文 → PlanningResult
//!
//! 两条判断路径：
//! - 启发式：取消 / 纠正措辞、`@skill` 显式技能标签（不调用后端）
//! - 推理后端：一次调用，返回 JSON 结构化判断
//!
//! 会话中存在活跃任务时，取消措辞直接胜出并跳过后端调用；纠正措辞还需要消息明确指向某个
//! 活跃任务（指代词，或与任务描述共享实词），否则交给后端结合活跃任务列表判断。
//! 后端失败、超时或输出无法解析时返回降级结果（reply、confidence = 0），从不向调用方报错。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::llm::{complete_with_timeout, CompletionOptions, LlmClient, LlmError};
use crate::memory::Message;
use crate::planner::{PlanAction, PlanningResult};
use crate::tasks::{TaskId, TaskStatus, TaskType};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassificationError {
    #[error("Classifier backend failed: {0}")]
    Backend(#[from] LlmError),

    #[error("Classifier output is not a valid judgement: {0}")]
    Parse(String),
}

/// 分类时可见的会话状态
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub active_tasks: Vec<ActiveTaskSummary>,
}

#[derive(Debug, Clone)]
pub struct ActiveTaskSummary {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub description: String,
}

impl SessionContext {
    pub fn has_active_task(&self) -> bool {
        !self.active_tasks.is_empty()
    }
}

/// 启发式信号
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeuristicSignal {
    pub cancellation: bool,
    pub correction: bool,
    pub skills: Vec<String>,
}

fn cancel_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:please\s+)?(?:cancel|stop|abort|halt|kill|never\s*mind|forget\s+(?:it|that|about\s+it))\b",
        )
        .ok()
    })
    .as_ref()
}

fn correction_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:(?:actually|instead|modify|change|update|amend|correction|wait)\b|no,|also\b.*\b(?:add|include)\b)",
        )
        .ok()
    })
    .as_ref()
}

fn anaphora_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:it|its|that|this|them|those|these)\b|\bthe\s+(?:fix|task|change|patch|result|answer|plan|work|one|same)\b|它|这个|那个|刚才|上面",
        )
        .ok()
    })
    .as_ref()
}

/// 不参与“指向任务”判断的虚词与纠正动词
const FILLER_WORDS: &[&str] = &[
    "actually", "instead", "modify", "change", "update", "amend", "correction", "wait", "also",
    "add", "include", "and", "the", "for", "with", "use", "please", "can", "you", "into",
    "from", "then", "make", "should", "not", "but", "now", "just", "more", "less", "all",
];

fn content_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3 && !FILLER_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// 纠正消息所指向的活跃任务：优先取与描述共享实词最多的任务，其次是带指代词时的最近任务
pub fn referenced_task<'a>(message: &str, session: &'a SessionContext) -> Option<&'a ActiveTaskSummary> {
    let words = content_words(message);
    let best = session
        .active_tasks
        .iter()
        .map(|t| {
            let described = content_words(&t.description);
            let shared = words.iter().filter(|w| described.contains(w)).count();
            (shared, t)
        })
        .filter(|(shared, _)| *shared > 0)
        .max_by_key(|(shared, _)| *shared)
        .map(|(_, t)| t);
    best.or_else(|| {
        anaphora_re()
            .filter(|re| re.is_match(message))
            .and_then(|_| session.active_tasks.first())
    })
}

fn skill_tag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)@([A-Za-z0-9][A-Za-z0-9_-]*)").ok())
        .as_ref()
}

/// 确定性启发式（纯函数）
pub fn heuristics(message: &str) -> HeuristicSignal {
    let trimmed = message.trim();
    let cancellation = cancel_re().is_some_and(|re| re.is_match(trimmed))
        || ["取消", "停止", "算了", "不用了"]
            .iter()
            .any(|k| trimmed.starts_with(k));
    let correction = !cancellation
        && (correction_re().is_some_and(|re| re.is_match(trimmed))
            || ["改成", "修改", "不对", "另外", "再加"]
                .iter()
                .any(|k| trimmed.starts_with(k)));

    let mut skills: Vec<String> = Vec::new();
    if let Some(re) = skill_tag_re() {
        for cap in re.captures_iter(trimmed) {
            let name = cap[1].to_lowercase();
            if !skills.contains(&name) {
                skills.push(name);
            }
        }
    }

    HeuristicSignal {
        cancellation,
        correction,
        skills,
    }
}

/// 关键词推断任务类型（后端未给出类型时使用）
pub fn infer_task_type(message: &str) -> TaskType {
    let lower = message.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));

    if has(&["test", "测试", "coverage", "单元测试"]) {
        TaskType::Testing
    } else if has(&["review", "审查", "检查代码", "audit"]) {
        TaskType::Review
    } else if has(&["debug", "bug", "fix", "crash", "error", "调试", "修复", "报错"]) {
        TaskType::Debugging
    } else if has(&[
        "implement", "write", "create", "build", "refactor", "code", "编写", "实现", "写代码",
    ]) {
        TaskType::CodeGeneration
    } else if has(&["analy", "summar", "explain", "compare", "分析", "总结", "概括"]) {
        TaskType::Analysis
    } else {
        TaskType::Other
    }
}

/// 后端 JSON 判断（字段全部可缺省）
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawJudgement {
    action: Option<String>,
    task_type: Option<String>,
    subagent_type: Option<String>,
    skills: Vec<String>,
    estimated_steps: Option<u32>,
    confidence: Option<f64>,
    justification: Option<String>,
    correction: bool,
    cancellation: bool,
    task_id: Option<String>,
}

const CLASSIFIER_PROMPT: &str = r#"You are the planning step of an orchestration agent. Judge the user's latest message.

Reply with ONLY one JSON object:
{"action": "reply|delegate|multi_step|complete",
 "task_type": "code_generation|review|debugging|testing|analysis|other",
 "subagent_type": "<worker kind or null>",
 "skills": ["<skill name>", ...],
 "estimated_steps": <integer>,
 "confidence": <0.0-1.0>,
 "justification": "<one sentence>",
 "correction": <true if the message amends one of the active tasks>,
 "cancellation": <true if the message asks to stop one of the active tasks>,
 "task_id": "<id of the active task concerned, or null>"}

- reply: you can answer directly in one message.
- delegate: one worker should carry out the work.
- multi_step: the work needs several dependent steps.
- complete: the user asks about the status or result of work already running.
A new, unrelated request is never a correction, even while other tasks are active."#;

pub struct TaskClassifier {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl TaskClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// 分类；永不失败
    pub async fn classify(
        &self,
        message: &str,
        history: &[Message],
        session: &SessionContext,
    ) -> PlanningResult {
        let signal = heuristics(message);

        if let Some(result) = Self::heuristic_verdict(message, &signal, session) {
            tracing::debug!("Heuristic verdict for '{}': {:?}", message, result.action);
            return result;
        }

        match self.ask_backend(message, history, session).await {
            Ok(mut result) => {
                result.skills = merge_skills(&signal.skills, &result.skills);
                result
            }
            Err(e) => {
                tracing::warn!("Classification degraded: {}", e);
                let mut fallback = PlanningResult::degraded(&e);
                fallback.task_type = infer_task_type(message);
                fallback.skills = signal.skills;
                fallback
            }
        }
    }

    /// 只有在会话有活跃任务时，取消信号才算高置信；纠正信号还必须能定位到被纠正的任务
    fn heuristic_verdict(
        message: &str,
        signal: &HeuristicSignal,
        session: &SessionContext,
    ) -> Option<PlanningResult> {
        let latest = session.active_tasks.first()?;
        if signal.cancellation {
            let mut r = PlanningResult::reply("explicit cancellation phrasing")
                .with_action(PlanAction::Complete)
                .with_confidence(0.95)
                .with_skills(signal.skills.clone());
            r.task_type = latest.task_type;
            r.cancellation = true;
            r.target_task = Some(latest.id.clone());
            return Some(r);
        }
        if signal.correction {
            let target = referenced_task(message, session)?;
            let mut r = PlanningResult::delegate(target.task_type, 0.9)
                .with_skills(signal.skills.clone());
            r.justification = format!("explicit correction of {}: {}", target.id, message.trim());
            r.correction = true;
            r.target_task = Some(target.id.clone());
            return Some(r);
        }
        None
    }

    async fn ask_backend(
        &self,
        message: &str,
        history: &[Message],
        session: &SessionContext,
    ) -> Result<PlanningResult, ClassificationError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(CLASSIFIER_PROMPT));
        messages.extend(history.iter().cloned());

        let mut user = String::new();
        if session.has_active_task() {
            user.push_str("Active tasks:\n");
            for t in &session.active_tasks {
                user.push_str(&format!("- {} [{}] {}: {}\n", t.id, t.status, t.task_type, t.description));
            }
            user.push('\n');
        }
        user.push_str("Message: ");
        user.push_str(message);
        messages.push(Message::user(user));

        let options = CompletionOptions::new()
            .with_max_tokens(300)
            .with_temperature(0.0)
            .with_timeout(self.timeout);
        let output = complete_with_timeout(self.llm.as_ref(), &messages, &options).await?;
        parse_judgement(&output, message)
    }
}

/// 解析后端输出：提取 JSON 块（```json 围栏或首尾花括号），再裁剪到合法取值范围
pub fn parse_judgement(output: &str, message: &str) -> Result<PlanningResult, ClassificationError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return Err(ClassificationError::Parse(trimmed.to_string()));
        }
    } else {
        return Err(ClassificationError::Parse(trimmed.to_string()));
    };

    let raw: RawJudgement = serde_json::from_str(json_str)
        .map_err(|e| ClassificationError::Parse(format!("{}: {}", e, json_str)))?;

    let action = raw
        .action
        .as_deref()
        .map(PlanAction::parse_lossy)
        .ok_or_else(|| ClassificationError::Parse("missing action".to_string()))?;
    let task_type = raw
        .task_type
        .as_deref()
        .map(TaskType::parse_lossy)
        .unwrap_or_else(|| infer_task_type(message));
    let confidence = raw
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0) as f32;

    Ok(PlanningResult {
        action,
        task_type,
        subagent_type: raw
            .subagent_type
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty() && s != "null"),
        skills: merge_skills(&[], &raw.skills),
        estimated_steps: raw.estimated_steps.unwrap_or(1).max(1),
        confidence,
        justification: raw.justification.unwrap_or_default(),
        correction: raw.correction && !raw.cancellation,
        cancellation: raw.cancellation,
        target_task: raw
            .task_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s != "null"),
        degraded: false,
    })
}

fn merge_skills(first: &[String], second: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in first.iter().chain(second.iter()) {
        let s = s.trim().to_lowercase();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn with_active() -> SessionContext {
        SessionContext {
            active_tasks: vec![ActiveTaskSummary {
                id: "task_1".into(),
                task_type: TaskType::Debugging,
                status: TaskStatus::Running,
                description: "fix the login bug".into(),
            }],
        }
    }

    #[test]
    fn test_heuristics_detect_phrasing_and_tags() {
        assert!(heuristics("Cancel that please").cancellation);
        assert!(heuristics("never mind").cancellation);
        assert!(heuristics("取消这个任务").cancellation);
        assert!(!heuristics("how do I cancel a subscription?").cancellation);

        assert!(heuristics("modify the login fix to also add a test").correction);
        assert!(heuristics("Actually, use postgres").correction);
        assert!(!heuristics("write a parser").correction);

        let s = heuristics("write tests @pytest and @House-Style, mail me@example.com");
        assert_eq!(s.skills, vec!["pytest".to_string(), "house-style".to_string()]);
    }

    #[test]
    fn test_infer_task_type() {
        assert_eq!(infer_task_type("add unit tests for auth"), TaskType::Testing);
        assert_eq!(infer_task_type("the app crashes on start"), TaskType::Debugging);
        assert_eq!(infer_task_type("summarize the report"), TaskType::Analysis);
        assert_eq!(infer_task_type("hello there"), TaskType::Other);
    }

    #[test]
    fn test_parse_judgement_clips_values() {
        let out = "Sure!\n```json\n{\"action\":\"delegate\",\"task_type\":\"poetry\",\"confidence\":3.5,\"skills\":[\"Rust\",\"rust\"]}\n```";
        let r = parse_judgement(out, "x").unwrap();
        assert_eq!(r.action, PlanAction::Delegate);
        assert_eq!(r.task_type, TaskType::Other);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.skills, vec!["rust".to_string()]);
        assert_eq!(r.estimated_steps, 1);

        assert!(parse_judgement("I think you should reply.", "x").is_err());
        assert!(parse_judgement("{\"task_type\":\"review\"}", "x").is_err());
    }

    #[tokio::test]
    async fn test_correction_with_active_task_skips_backend() {
        let llm = Arc::new(ScriptedLlmClient::always(Ok("{}".into())));
        let c = TaskClassifier::new(llm.clone(), Duration::from_secs(1));
        let r = c
            .classify("modify the login fix to also add a test", &[], &with_active())
            .await;
        assert!(r.correction);
        assert_eq!(r.action, PlanAction::Delegate);
        assert_eq!(r.task_type, TaskType::Debugging);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_correction_phrase_without_task_asks_backend() {
        let llm = Arc::new(ScriptedLlmClient::always(Ok(
            r#"{"action":"delegate","task_type":"code_generation","confidence":0.8,"estimated_steps":2}"#.into(),
        )));
        let c = TaskClassifier::new(llm.clone(), Duration::from_secs(1));
        let r = c
            .classify("update the README with @docs", &[], &SessionContext::default())
            .await;
        assert!(!r.correction);
        assert_eq!(r.action, PlanAction::Delegate);
        assert_eq!(r.skills, vec!["docs".to_string()]);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_imperative_is_not_a_correction() {
        let llm = Arc::new(ScriptedLlmClient::always(Ok(
            r#"{"action":"delegate","task_type":"code_generation","confidence":0.8}"#.into(),
        )));
        let c = TaskClassifier::new(llm.clone(), Duration::from_secs(1));
        let r = c
            .classify("update the README with install instructions", &[], &with_active())
            .await;
        assert!(!r.correction);
        assert_eq!(r.target_task, None);
        assert_eq!(r.task_type, TaskType::CodeGeneration);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_anaphoric_correction_targets_latest_task() {
        let llm = Arc::new(ScriptedLlmClient::always(Ok("{}".into())));
        let c = TaskClassifier::new(llm.clone(), Duration::from_secs(1));
        let r = c.classify("actually, make it log the error too", &[], &with_active()).await;
        assert!(r.correction);
        assert_eq!(r.target_task.as_deref(), Some("task_1"));
        assert_eq!(llm.calls(), 0);
    }

    #[test]
    fn test_referenced_task_prefers_shared_words() {
        let mut session = with_active();
        session.active_tasks.push(ActiveTaskSummary {
            id: "task_2".into(),
            task_type: TaskType::Testing,
            status: TaskStatus::Pending,
            description: "write tests for the billing module".into(),
        });
        let hit = referenced_task("change the billing tests to use fixtures", &session);
        assert_eq!(hit.map(|t| t.id.as_str()), Some("task_2"));
        assert!(referenced_task("update the README", &session).is_none());
    }

    #[test]
    fn test_parse_judgement_reads_backend_correction() {
        let out = r#"{"action":"delegate","correction":true,"task_id":"task_1","confidence":0.7}"#;
        let r = parse_judgement(out, "no, use postgres").unwrap();
        assert!(r.correction);
        assert!(!r.cancellation);
        assert_eq!(r.target_task.as_deref(), Some("task_1"));
    }

    #[tokio::test]
    async fn test_backend_timeout_degrades() {
        let llm = Arc::new(
            ScriptedLlmClient::always(Ok("{\"action\":\"delegate\"}".into()))
                .with_delay(Duration::from_secs(5)),
        );
        let c = TaskClassifier::new(llm, Duration::from_millis(20));
        let r = c
            .classify("summarize the report", &[], &SessionContext::default())
            .await;
        assert_eq!(r.action, PlanAction::Reply);
        assert_eq!(r.confidence, 0.0);
        assert!(r.degraded);
        assert!(r.justification.contains("degraded"));
    }

    #[tokio::test]
    async fn test_unparseable_output_degrades() {
        let llm = Arc::new(ScriptedLlmClient::always(Ok("no json here".into())));
        let c = TaskClassifier::new(llm, Duration::from_secs(1));
        let r = c.classify("hello", &[], &SessionContext::default()).await;
        assert!(r.degraded);
    }
}
