//! 技能展开：把请求映射为最终技能列表
//!
//! 优先级（先匹配者胜）：请求中显式指定 > 显式 agent 类型映射 > 任务类型映射；
//! 默认技能集始终追加在末尾。结果按首次出现去重、保序。

use std::collections::{HashMap, HashSet};

use crate::config::SkillsSection;
use crate::tasks::TaskType;

#[derive(Debug, Clone, Default)]
pub struct SkillExpander {
    defaults: Vec<String>,
    by_task_type: HashMap<TaskType, Vec<String>>,
    by_agent_type: HashMap<String, Vec<String>>,
}

impl SkillExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由 [skills] 配置构建；任务类型键按宽松规则解析
    pub fn from_config(cfg: &SkillsSection) -> Self {
        let mut expander = Self::new().with_defaults(cfg.defaults.clone());
        for (key, skills) in &cfg.by_task_type {
            let task_type = TaskType::parse_lossy(key);
            if task_type == TaskType::Other && key.to_lowercase() != "other" {
                tracing::warn!("Unknown task type '{}' in skill mapping, using 'other'", key);
            }
            expander = expander.map_task_type(task_type, skills.clone());
        }
        for (agent, skills) in &cfg.by_agent_type {
            expander = expander.map_agent_type(agent.clone(), skills.clone());
        }
        expander
    }

    pub fn with_defaults(mut self, defaults: Vec<String>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn map_task_type(mut self, task_type: TaskType, skills: Vec<String>) -> Self {
        self.by_task_type.entry(task_type).or_default().extend(skills);
        self
    }

    pub fn map_agent_type(mut self, agent_type: impl Into<String>, skills: Vec<String>) -> Self {
        self.by_agent_type
            .entry(agent_type.into())
            .or_default()
            .extend(skills);
        self
    }

    pub fn expand(
        &self,
        explicit: &[String],
        agent_type: Option<&str>,
        task_type: Option<TaskType>,
    ) -> Vec<String> {
        let agent_mapped = agent_type
            .and_then(|a| self.by_agent_type.get(a))
            .filter(|s| !s.is_empty());
        let type_mapped = task_type
            .and_then(|t| self.by_task_type.get(&t))
            .filter(|s| !s.is_empty());

        let primary: &[String] = if !explicit.is_empty() {
            explicit
        } else if let Some(skills) = agent_mapped {
            skills
        } else if let Some(skills) = type_mapped {
            skills
        } else {
            &[]
        };

        dedup_in_order(primary.iter().chain(self.defaults.iter()))
    }
}

fn dedup_in_order<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .filter(|n| seen.insert(n.to_string()))
        .map(str::to_string)
        .collect()
}
