//! 编排器构建器：统一的组件装配逻辑
//!
//! 未显式注入的组件按配置创建：推理后端走 `create_llm_from_config`，记忆有路径时用 JSONL 文件，
//! 技能有目录时从目录加载，worker 默认为 `LlmWorker`。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{load_config, AppConfig};
use crate::context::ContextAssembler;
use crate::core::orchestrator::Components;
use crate::core::{Orchestrator, OrchestratorError};
use crate::llm::{create_llm_from_config, CompletionOptions, LlmClient};
use crate::memory::{InMemoryMemoryStore, JsonlMemoryStore, MemoryStore};
use crate::planner::{DecisionMaker, StepPlanner, TaskClassifier};
use crate::skills::{SkillExpander, SkillLoader, SkillResolver, StaticSkillResolver};
use crate::tasks::TaskStore;
use crate::worker::{LlmWorker, Worker, WorkerManager};

pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    memory: Option<Arc<dyn MemoryStore>>,
    skills: Option<Arc<dyn SkillResolver>>,
    worker: Option<Arc<dyn Worker>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            memory: None,
            skills: None,
            worker: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_skill_resolver(mut self, skills: Arc<dyn SkillResolver>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// 替换默认的 LlmWorker（测试中注入可控 worker）
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// 装配并启动编排器；需在 tokio 运行时内调用
    pub async fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let config = Arc::new(self.config);
        let llm = self.llm.unwrap_or_else(|| create_llm_from_config(&config));

        let memory: Arc<dyn MemoryStore> = match (self.memory, &config.memory.path) {
            (Some(memory), _) => memory,
            (None, Some(path)) => {
                tracing::info!("Memory persisted to {}", path.display());
                Arc::new(JsonlMemoryStore::open(path)?)
            }
            (None, None) => Arc::new(InMemoryMemoryStore::new()),
        };

        let skills: Arc<dyn SkillResolver> = match (self.skills, &config.skills.dir) {
            (Some(skills), _) => skills,
            (None, Some(dir)) => {
                let loader = SkillLoader::new(dir);
                if let Err(e) = loader.load_all().await {
                    tracing::warn!("Failed to load skills from {}: {}", dir.display(), e);
                }
                Arc::new(loader)
            }
            (None, None) => Arc::new(StaticSkillResolver::new()),
        };

        let request_timeout = Duration::from_secs(config.llm.timeouts.request);
        let tasks = Arc::new(TaskStore::new());
        let assembler = Arc::new(
            ContextAssembler::new(Arc::clone(&memory), skills, Arc::clone(&llm), Arc::clone(&tasks))
                .with_static_material(config.app.resolve_identity_prompt())
                .with_expander(SkillExpander::from_config(&config.skills))
                .with_config(config.context.clone())
                .with_summary_timeout(request_timeout),
        );

        let worker: Arc<dyn Worker> = match self.worker {
            Some(worker) => worker,
            None => {
                let options = CompletionOptions::new()
                    .with_max_tokens(config.llm.max_tokens)
                    .with_temperature(config.llm.temperature)
                    .with_timeout(request_timeout);
                Arc::new(LlmWorker::new(Arc::clone(&assembler), Arc::clone(&llm)).with_options(options))
            }
        };
        let (workers, worker_events) = WorkerManager::new(
            worker,
            Arc::clone(&tasks),
            config.orchestrator.max_concurrent,
            config.orchestrator.worker_timeout(),
        );

        let components = Components {
            classifier: TaskClassifier::new(Arc::clone(&llm), config.classifier.timeout()),
            step_planner: StepPlanner::new(Arc::clone(&llm), config.classifier.timeout()),
            decision: DecisionMaker::from_config(&config.orchestrator),
            config,
            llm,
            memory,
            tasks,
            assembler,
            workers,
            worker_events,
        };
        Ok(Orchestrator::start(components))
    }
}

/// 从配置文件创建编排器；配置加载失败时退回默认值
pub async fn create_orchestrator(config_path: Option<PathBuf>) -> anyhow::Result<Orchestrator> {
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let orchestrator = OrchestratorBuilder::new(config).build().await?;
    Ok(orchestrator)
}
