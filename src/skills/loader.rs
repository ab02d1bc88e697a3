//! 技能加载器
//!
//! 从技能目录加载 skill.toml + capability.md（+ template.md）并缓存，
//! 作为 SkillResolver 的目录实现：resolve 返回完整能力描述（含模板）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::skills::{SkillError, SkillResolver};

/// 技能元数据（skill.toml 的 [skill] 表）
#[derive(Debug, Clone, Deserialize)]
pub struct SkillMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SkillToml {
    skill: SkillMeta,
}

/// 完整技能数据
#[derive(Debug, Clone)]
pub struct Skill {
    pub meta: SkillMeta,
    pub capability: String,
    pub template: Option<String>,
    pub dir: PathBuf,
}

impl Skill {
    /// 注入上下文的正文：标题、描述、能力说明，有模板时附在末尾
    pub fn render(&self) -> String {
        let mut out = format!(
            "# {} ({})\n\n{}\n\n{}",
            self.meta.name, self.meta.id, self.meta.description, self.capability
        );
        if let Some(template) = &self.template {
            out.push_str("\n\n## Template\n\n");
            out.push_str(template);
        }
        out
    }
}

/// 技能缓存
pub type SkillCache = Arc<RwLock<HashMap<String, Skill>>>;

/// 目录技能加载器
pub struct SkillLoader {
    skills_dir: PathBuf,
    cache: SkillCache,
}

impl SkillLoader {
    pub fn new(skills_dir: impl AsRef<Path>) -> Self {
        Self {
            skills_dir: skills_dir.as_ref().to_path_buf(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> SkillCache {
        Arc::clone(&self.cache)
    }

    /// 加载所有技能并缓存；目录不存在时返回空列表
    pub async fn load_all(&self) -> anyhow::Result<Vec<Skill>> {
        let mut skills = Vec::new();

        if !self.skills_dir.exists() {
            tracing::warn!("Skills dir {} does not exist", self.skills_dir.display());
            return Ok(skills);
        }

        for entry in std::fs::read_dir(&self.skills_dir)?.flatten() {
            let path = entry.path();
            if path.is_dir() {
                match Self::load_skill(&path) {
                    Ok(Some(skill)) => skills.push(skill),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Skipping skill at {}: {}", path.display(), e),
                }
            }
        }

        let mut cache = self.cache.write().await;
        for skill in &skills {
            cache.insert(skill.meta.id.clone(), skill.clone());
        }

        tracing::info!("Loaded {} skills from {}", skills.len(), self.skills_dir.display());
        Ok(skills)
    }

    /// 加载单个技能目录；没有 skill.toml 的目录返回 None
    fn load_skill(dir: &Path) -> anyhow::Result<Option<Skill>> {
        let skill_toml = dir.join("skill.toml");
        if !skill_toml.exists() {
            return Ok(None);
        }

        let toml_content = std::fs::read_to_string(&skill_toml)?;
        let meta = toml::from_str::<SkillToml>(&toml_content)?.skill;
        let capability = std::fs::read_to_string(dir.join("capability.md")).unwrap_or_default();
        let template = std::fs::read_to_string(dir.join("template.md")).ok();

        Ok(Some(Skill {
            meta,
            capability,
            template,
            dir: dir.to_path_buf(),
        }))
    }

    pub async fn get(&self, id: &str) -> Option<Skill> {
        self.cache.read().await.get(id).cloned()
    }

    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SkillResolver for SkillLoader {
    async fn resolve(&self, name: &str) -> Result<String, SkillError> {
        self.get(name)
            .await
            .map(|s| s.render())
            .ok_or_else(|| SkillError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, id: &str, with_template: bool) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("skill.toml"),
            format!(
                "[skill]\nid = \"{id}\"\nname = \"{id} skill\"\ndescription = \"about {id}\"\ntags = [\"x\"]\n"
            ),
        )
        .unwrap();
        std::fs::write(dir.join("capability.md"), format!("how to {id}")).unwrap();
        if with_template {
            std::fs::write(dir.join("template.md"), "fill me").unwrap();
        }
    }

    #[tokio::test]
    async fn test_load_and_resolve() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "pytest", true);
        write_skill(root.path(), "review", false);
        std::fs::create_dir_all(root.path().join("not-a-skill")).unwrap();

        let loader = SkillLoader::new(root.path());
        let loaded = loader.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loader.list_ids().await, vec!["pytest", "review"]);

        let text = loader.resolve("pytest").await.unwrap();
        assert!(text.contains("how to pytest"));
        assert!(text.contains("fill me"));
        assert!(matches!(
            loader.resolve("missing").await,
            Err(SkillError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_dir_loads_nothing() {
        let loader = SkillLoader::new("/definitely/not/here");
        assert!(loader.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_toml_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "good", false);
        let bad = root.path().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("skill.toml"), "not = [valid").unwrap();

        let loader = SkillLoader::new(root.path());
        assert_eq!(loader.load_all().await.unwrap().len(), 1);
    }
}
