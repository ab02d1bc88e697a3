//! 技能解析接口：按名字取技能正文
//!
//! 任何后备存储（内存表、目录、远端服务）都实现同一个 `resolve(name) -> text`。

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkillError {
    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Failed to read skill {name}: {reason}")]
    Io { name: String, reason: String },
}

/// 技能解析 trait；NotFound 由调用方当作 no-op 跳过
#[async_trait]
pub trait SkillResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<String, SkillError>;
}

/// 内存技能表
#[derive(Debug, Default, Clone)]
pub struct StaticSkillResolver {
    skills: HashMap<String, String>,
}

impl StaticSkillResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skill(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.skills.insert(name.into(), content.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.skills.insert(name.into(), content.into());
    }
}

#[async_trait]
impl SkillResolver for StaticSkillResolver {
    async fn resolve(&self, name: &str) -> Result<String, SkillError> {
        self.skills
            .get(name)
            .cloned()
            .ok_or_else(|| SkillError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticSkillResolver::new().with_skill("rust", "prefer Result over panics");
        assert_eq!(
            resolver.resolve("rust").await.as_deref(),
            Ok("prefer Result over panics")
        );
        assert_eq!(
            resolver.resolve("cobol").await,
            Err(SkillError::NotFound("cobol".to_string()))
        );
    }
}
