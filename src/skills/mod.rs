//! 技能系统
//!
//! 技能（Skill）是一段按名字加载进上下文的说明性内容，用于让 worker 或编排器专注某类任务。
//!
//! 目录结构：
//! ```text
//! config/skills/
//! ├── pytest/
//! │   ├── skill.toml      # 技能元数据
//! │   ├── capability.md   # 能力描述（注入上下文）
//! │   └── template.md     # 模板（可选）
//! └── ...
//! ```

mod expander;
mod loader;
mod resolver;

pub use expander::SkillExpander;
pub use loader::{Skill, SkillCache, SkillLoader, SkillMeta};
pub use resolver::{SkillError, SkillResolver, StaticSkillResolver};
