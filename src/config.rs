//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_CONCURRENT=8`）。
//! 加载完成后配置不可变，由编排器以 `Arc<AppConfig>` 持有。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub classifier: ClassifierSection,
    pub context: ContextSection,
    pub session: SessionSection,
    pub memory: MemorySection,
    pub skills: SkillsSection,
}

/// [app] 段：应用名与身份提示（上下文第一层的静态材料）
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_identity_prompt")]
    pub identity_prompt: String,
    /// 若设置，则从该文件读取身份提示，覆盖 identity_prompt
    pub identity_prompt_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            identity_prompt: default_identity_prompt(),
            identity_prompt_path: None,
        }
    }
}

fn default_app_name() -> String {
    "hive".to_string()
}

fn default_identity_prompt() -> String {
    "You are Hive, an orchestration agent. Answer directly when you can; \
     delegate multi-step engineering work to worker agents and report their progress."
        .to_string()
}

impl AppSection {
    /// 读取身份提示；文件读取失败时退回内联文本
    pub fn resolve_identity_prompt(&self) -> String {
        match &self.identity_prompt_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => self.identity_prompt.clone(),
                Err(e) => {
                    tracing::warn!("Failed to read identity prompt {}: {}", path.display(), e);
                    self.identity_prompt.clone()
                }
            },
            None => self.identity_prompt.clone(),
        }
    }
}

/// [llm] 段：后端选择、超时与采样参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；实际选择还取决于 API Key 是否存在
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.3
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [orchestrator] 段：并发上限、重试、阈值与外部代理
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 每个 worker 的墙钟截止时间（秒），不是单次后端调用的超时
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// 低于此置信度一律直接回复
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// 预估步骤数达到此值时，delegate 判断按多步工作流执行
    #[serde(default = "default_complexity_threshold")]
    pub complexity_threshold: u32,
    /// 由外部代理处理的 subagent 类型
    #[serde(default)]
    pub external_agents: Vec<String>,
    /// 事件广播通道容量
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            worker_timeout_secs: default_worker_timeout_secs(),
            confidence_threshold: default_confidence_threshold(),
            complexity_threshold: default_complexity_threshold(),
            external_agents: Vec::new(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl OrchestratorSection {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_retries() -> u32 {
    2
}

fn default_worker_timeout_secs() -> u64 {
    300
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_complexity_threshold() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    256
}

/// [classifier] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierSection {
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
    /// 送入分类器的历史轮数
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_classifier_timeout_secs(),
            history_turns: default_history_turns(),
        }
    }
}

impl ClassifierSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_classifier_timeout_secs() -> u64 {
    20
}

fn default_history_turns() -> usize {
    10
}

/// [context] 段：上下文预算（估算 token）
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,
    /// 记忆层最多选取的记录数
    #[serde(default = "default_memory_excerpts")]
    pub memory_excerpts: usize,
    /// 压缩摘要的 max_tokens
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
            memory_excerpts: default_memory_excerpts(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

fn default_budget_tokens() -> usize {
    6000
}

fn default_memory_excerpts() -> usize {
    12
}

fn default_summary_max_tokens() -> u32 {
    512
}

/// [session] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 过期扫描与记忆保留清理的周期（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// [memory] 段：持久化路径与保留策略
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// JSONL 文件路径；未设置时使用内存存储
    pub path: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_min_importance")]
    pub min_importance: f32,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            path: None,
            retention_days: default_retention_days(),
            min_importance: default_min_importance(),
        }
    }
}

fn default_retention_days() -> u64 {
    30
}

fn default_min_importance() -> f32 {
    0.2
}

/// [skills] 段：技能目录与映射表
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SkillsSection {
    /// 技能目录（skills/<id>/skill.toml + capability.md）；未设置时只用内联映射
    pub dir: Option<PathBuf>,
    /// 始终加载的默认技能
    #[serde(default)]
    pub defaults: Vec<String>,
    /// 任务类型（snake_case）→ 技能列表
    #[serde(default)]
    pub by_task_type: HashMap<String, Vec<String>>,
    /// subagent 类型 → 技能列表
    #[serde(default)]
    pub by_agent_type: HashMap<String, Vec<String>>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
