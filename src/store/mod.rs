//! 执行记录持久化
//!
//! ExecutionStore 是引擎与存储层的唯一接口：创建执行、追加迭代、更新状态、读取记录。
//! 所有写操作都带 expected_version（乐观锁），版本不符即拒绝，保证同一执行最多一个活跃写入者。
//! 记录变更逻辑集中在 apply_iteration / apply_status_update，存储实现与内存副本共用同一套规则。

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::core::{
    ExecutionRecord, ExecutionStatus, IterationLog, Plan, RetryState, Task, UserExchange,
};

pub use memory::InMemoryExecutionStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteExecutionStore;

/// 存储层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    #[error("Out-of-order iteration on {id}: expected index {expected}, got {got}")]
    OutOfOrder { id: String, expected: usize, got: usize },

    #[error("Invalid transition on {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// 只有 in_progress 的执行可以追加迭代
    #[error("Execution {id} is not running (status: {status})")]
    NotRunning { id: String, status: ExecutionStatus },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// 状态更新请求（时间戳在构造时确定，存储与内存副本结果一致）
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// 进入 needs_input 时要问用户的问题
    pub question: Option<String>,
    /// 从 needs_input 恢复时用户的回答
    pub answer: Option<String>,
    pub retry_state: Option<RetryState>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            question: None,
            answer: None,
            retry_state: None,
            at: Utc::now(),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    pub fn with_retry_state(mut self, retry_state: RetryState) -> Self {
        self.retry_state = Some(retry_state);
        self
    }
}

/// 执行记录存储接口；实现必须可被多个任务循环并发访问
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// 新建执行记录（status = pending, version = 0）
    async fn create_execution(&self, task: &Task, plan: Plan) -> Result<ExecutionRecord, StoreError>;

    /// 追加一条迭代日志，返回新版本号
    async fn append_iteration(
        &self,
        execution_id: &str,
        expected_version: u64,
        log: &IterationLog,
    ) -> Result<u64, StoreError>;

    /// 状态迁移，返回新版本号
    async fn update_status(
        &self,
        execution_id: &str,
        expected_version: u64,
        update: &StatusUpdate,
    ) -> Result<u64, StoreError>;

    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError>;

    /// 未到终态的执行 ID（进程重启后用于恢复）
    async fn list_unfinished(&self) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn check_version(record: &ExecutionRecord, expected: u64) -> Result<(), StoreError> {
    if record.version != expected {
        return Err(StoreError::VersionConflict {
            id: record.id.clone(),
            expected,
            actual: record.version,
        });
    }
    Ok(())
}

/// 追加迭代：只允许 in_progress，index 必须无间隙递增；同步当前计划与失败计数
pub fn apply_iteration(record: &mut ExecutionRecord, log: &IterationLog) -> Result<(), StoreError> {
    if record.status != ExecutionStatus::InProgress {
        return Err(StoreError::NotRunning {
            id: record.id.clone(),
            status: record.status,
        });
    }
    if log.index != record.iterations.len() {
        return Err(StoreError::OutOfOrder {
            id: record.id.clone(),
            expected: record.iterations.len(),
            got: log.index,
        });
    }
    record.plan = log.plan_snapshot.clone();
    record.retry_state = log.retry_state.clone();
    record.iterations.push(log.clone());
    record.updated_at = log.timestamp;
    record.version += 1;
    Ok(())
}

/// 状态迁移：校验状态机；进入终态写 completed_at；needs_input 记录问题；恢复时记录用户回答
pub fn apply_status_update(
    record: &mut ExecutionRecord,
    update: &StatusUpdate,
) -> Result<(), StoreError> {
    if !record.status.can_transition_to(update.status) {
        return Err(StoreError::InvalidTransition {
            id: record.id.clone(),
            from: record.status,
            to: update.status,
        });
    }
    let leaving_pause = record.status == ExecutionStatus::NeedsInput;
    record.status = update.status;

    if update.status == ExecutionStatus::NeedsInput {
        record.pending_question = update.question.clone();
    } else {
        let question = record.pending_question.take();
        if leaving_pause {
            if let Some(answer) = &update.answer {
                record.interactions.push(UserExchange {
                    question,
                    answer: answer.clone(),
                    at: update.at,
                });
            }
        }
    }
    if let Some(output) = &update.output {
        record.output = Some(output.clone());
    }
    if let Some(error) = &update.error {
        record.error = Some(error.clone());
    }
    if let Some(retry_state) = &update.retry_state {
        record.retry_state = retry_state.clone();
    }
    if update.status.is_terminal() {
        record.completed_at = Some(update.at);
    }
    record.updated_at = update.at;
    record.version += 1;
    Ok(())
}
