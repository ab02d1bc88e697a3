//! Hive - 多智能体编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 分层上下文组装与一次性压缩
//! - **core**: 编排器主控循环、会话注册表、事件流、错误
//! - **llm**: 推理后端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 带标签的记忆存储（内存 / JSONL）与对话历史
//! - **observability**: 日志初始化
//! - **planner**: 任务分类、决策表、多步拆解
//! - **skills**: 技能加载与展开
//! - **tasks**: 任务模型与状态机
//! - **worker**: 并发受限的 worker 生命周期管理
//! - **workflow**: 带依赖的多步工作流状态机

pub mod config;
pub mod context;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod skills;
pub mod tasks;
pub mod worker;
pub mod workflow;
