//! 引擎错误类型
//!
//! 工具级错误（找不到工具、参数非法、执行失败、超时）在循环内由 RetryPolicy 消化，只会出现在 IterationLog；
//! 结构性错误（PlanLocked / NoMorePhases）与控制面错误返回给编排 API 的调用方。

use thiserror::Error;

use crate::core::ExecutionStatus;
use crate::store::StoreError;

/// 编排引擎错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    // 以下三种工具级错误引擎内部不构造（循环内表现为 ToolOutcome::Failure），供嵌入方的工具与调用方使用
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 推理服务在内部重试耗尽后仍不可用
    #[error("Reasoning unavailable after {attempts} attempts: {message}")]
    ReasoningUnavailable { attempts: u32, message: String },

    /// 有工具调用在途时不允许替换计划
    #[error("Plan is locked by in-flight tool call '{0}'")]
    PlanLocked(String),

    #[error("No more phases to advance to")]
    NoMorePhases,

    /// 乐观锁冲突：同一执行已有另一个写入者
    #[error("Execution already running: {0}")]
    ExecutionAlreadyRunning(String),

    #[error("Iteration budget exceeded ({0} iterations)")]
    IterationBudgetExceeded(usize),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Invalid schema for tool '{tool}': {reason}")]
    InvalidSchema { tool: String, reason: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {id} is not awaiting input (status: {status})")]
    NotAwaitingInput { id: String, status: ExecutionStatus },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::ExecutionNotFound(id),
            StoreError::VersionConflict { id, .. } => EngineError::ExecutionAlreadyRunning(id),
            StoreError::InvalidTransition { from, to, .. } => {
                EngineError::InvalidTransition { from, to }
            }
            other => EngineError::Store(other.to_string()),
        }
    }
}
