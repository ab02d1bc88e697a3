//! 步骤规划：把 multi_step 任务拆成带依赖的步骤列表
//!
//! 后端输出 JSON（`{"steps": [...]}` 或直接数组）；失败或无法解析时退化为单步计划。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::{complete_with_timeout, CompletionOptions, LlmClient};
use crate::memory::Message;
use crate::tasks::TaskType;

/// 单步计划上限
const MAX_STEPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: description.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPlan {
    Wrapped { steps: Vec<StepSpec> },
    Bare(Vec<StepSpec>),
}

const STEP_PROMPT: &str = r#"Break the task into at most 8 concrete steps that a worker agent can execute one at a time.
Reply with ONLY JSON: {"steps": [{"id": "s1", "name": "...", "description": "...", "depends_on": []}, ...]}
Use depends_on to list ids of steps that must finish first. Independent steps should not depend on each other."#;

pub struct StepPlanner {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl StepPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// 拆解任务；永不失败，最差返回一个包含完整描述的单步
    pub async fn plan(&self, description: &str, task_type: TaskType) -> Vec<StepSpec> {
        let messages = vec![
            Message::system(STEP_PROMPT),
            Message::user(format!("Task type: {}\nTask: {}", task_type, description)),
        ];
        let options = CompletionOptions::new()
            .with_max_tokens(800)
            .with_temperature(0.0)
            .with_timeout(self.timeout);

        match complete_with_timeout(self.llm.as_ref(), &messages, &options).await {
            Ok(output) => match parse_steps(&output) {
                Some(steps) => steps,
                None => {
                    tracing::warn!("Step plan unparseable, using a single step");
                    single_step(description)
                }
            },
            Err(e) => {
                tracing::warn!("Step planner backend failed ({}), using a single step", e);
                single_step(description)
            }
        }
    }
}

pub fn single_step(description: &str) -> Vec<StepSpec> {
    vec![StepSpec::new("main", description)]
}

/// 提取并解析步骤；空列表视为失败
pub fn parse_steps(output: &str) -> Option<Vec<StepSpec>> {
    let trimmed = output.trim();
    let body = match trimmed.find("```json") {
        Some(start) => {
            let rest = &trimmed[start + 7..];
            rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
        }
        None => {
            let start = trimmed.find(['{', '['])?;
            let end = trimmed.rfind(['}', ']'])?;
            if end < start {
                return None;
            }
            &trimmed[start..=end]
        }
    };

    let mut steps = match serde_json::from_str::<RawPlan>(body.trim()).ok()? {
        RawPlan::Wrapped { steps } | RawPlan::Bare(steps) => steps,
    };
    steps.retain(|s| !s.id.trim().is_empty() && !s.description.trim().is_empty());
    steps.truncate(MAX_STEPS);
    for s in &mut steps {
        if s.name.trim().is_empty() {
            s.name = s.id.clone();
        }
    }
    // 截断后可能留下指向被丢弃步骤的依赖
    let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    for s in &mut steps {
        s.depends_on.retain(|d| ids.contains(d));
    }
    (!steps.is_empty()).then_some(steps)
}
