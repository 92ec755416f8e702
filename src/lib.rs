//! Hive - 自主任务执行编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 数据模型、计划管理、重试策略、执行监管与主控循环
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **reasoning**: 推理端抽象：把执行上下文交给 LLM，解析出下一步决策
//! - **store**: 执行记录持久化（内存 / SQLite），乐观锁版本控制
//! - **tools**: 工具注册表、参数校验、带超时与取消的分发器、内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod reasoning;
pub mod store;
pub mod tools;

pub use crate::core::{
    Decision, EngineConfig, EngineError, ExecutionId, ExecutionRecord, ExecutionStatus,
    Orchestrator, OrchestratorBuilder, Task,
};
