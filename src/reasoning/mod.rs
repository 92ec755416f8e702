//! 推理端抽象
//!
//! 引擎每轮把 DecisionContext（任务、当前计划、最近迭代窗口、可用工具、剩余预算）交给 ReasoningClient，
//! 得到一个 Decision。推理端是外部依赖：可能慢、可能失败，引擎负责重试与退避，不做任何决策本身。

pub mod llm;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::{Decision, ExecutionId, IterationLog, Plan, UserExchange};
use crate::tools::ToolDefinition;

pub use llm::{parse_decision, LlmReasoningClient};
pub use scripted::ScriptedReasoningClient;

/// 推理端错误；两种都会被引擎按退避策略重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReasoningError {
    #[error("Reasoning client unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed decision: {0}")]
    MalformedDecision(String),
}

/// 单轮决策输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub execution_id: ExecutionId,
    pub task_description: String,
    #[serde(default)]
    pub task_context: Map<String, Value>,
    pub plan: Plan,
    /// 最近 N 轮迭代（滑动窗口，N = engine.history_window）
    pub recent_iterations: Vec<IterationLog>,
    pub available_tools: Vec<ToolDefinition>,
    pub iteration_index: usize,
    pub remaining_iterations: usize,
    /// 所有阶段已完成，期望推理端给出 final_answer
    pub conclusion_requested: bool,
    #[serde(default)]
    pub interactions: Vec<UserExchange>,
}

/// 推理端：给定上下文返回下一步决策
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision, ReasoningError>;
}
