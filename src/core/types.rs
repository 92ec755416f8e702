//! 数据模型：Task、Decision、ToolOutcome、ExecutionRecord、IterationLog
//!
//! Task 是只读输入；ExecutionRecord 由单个编排循环独占写入，IterationLog 只追加不修改。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::plan::{Plan, PhaseDraft, PlanDraft};
use crate::core::retry::{RetryAction, RetryState};

/// 执行 ID
pub type ExecutionId = String;

/// 调用方提交的任务（创建后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner_id: String,
    /// 自然语言任务指令
    pub description: String,
    /// 不透明的键值上下文，原样传给推理端
    #[serde(default)]
    pub context: Map<String, Value>,
    /// 迭代预算；0 表示使用引擎默认值
    #[serde(default)]
    pub max_iterations: usize,
    #[serde(default)]
    pub linked_external_task_id: Option<String>,
    /// 调用方提供的初始计划；缺省时由任务描述合成单阶段计划
    #[serde(default)]
    pub initial_plan: Option<PlanDraft>,
}

impl Task {
    pub fn new(owner_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            owner_id: owner_id.into(),
            description: description.into(),
            context: Map::new(),
            max_iterations: 0,
            linked_external_task_id: None,
            initial_plan: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_linked_external_task(mut self, external_id: impl Into<String>) -> Self {
        self.linked_external_task_id = Some(external_id.into());
        self
    }

    /// 指定初始计划（goal + 阶段草稿）
    pub fn with_plan(mut self, goal: impl Into<String>, phases: Vec<PhaseDraft>) -> Self {
        self.initial_plan = Some(PlanDraft {
            goal: goal.into(),
            phases,
        });
        self
    }
}

/// 执行状态机：pending -> in_progress -> {needs_input, completed, failed, cancelled, timeout}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    /// 暂停等待用户输入，可恢复
    NeedsInput,
    Completed,
    Failed,
    Cancelled,
    /// 迭代预算耗尽（不是墙钟超时）
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::NeedsInput => "needs_input",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "in_progress" => Some(ExecutionStatus::InProgress),
            "needs_input" => Some(ExecutionStatus::NeedsInput),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            "timeout" => Some(ExecutionStatus::Timeout),
            _ => None,
        }
    }

    /// 终态之后记录只读
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Pending => matches!(next, InProgress | Cancelled | Failed),
            InProgress => matches!(next, NeedsInput | Completed | Failed | Cancelled | Timeout),
            NeedsInput => matches!(next, InProgress | Cancelled | Failed),
            Completed | Failed | Cancelled | Timeout => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 推理端单轮输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// 调用工具
    ToolCall {
        name: String,
        #[serde(default)]
        args: Value,
    },
    /// 任务结束，给出最终结果
    FinalAnswer { output: Value },
    /// 需要用户补充信息
    AskUser { question: String },
    /// 替换剩余计划（仅在两轮迭代之间生效）
    UpdatePlan { phases: Vec<PhaseDraft> },
}

impl Decision {
    pub fn tool_call(name: impl Into<String>, args: Value) -> Self {
        Decision::ToolCall {
            name: name.into(),
            args,
        }
    }

    pub fn final_answer(output: impl Into<Value>) -> Self {
        Decision::FinalAnswer {
            output: output.into(),
        }
    }

    pub fn ask_user(question: impl Into<String>) -> Self {
        Decision::AskUser {
            question: question.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decision::ToolCall { .. } => "tool_call",
            Decision::FinalAnswer { .. } => "final_answer",
            Decision::AskUser { .. } => "ask_user",
            Decision::UpdatePlan { .. } => "update_plan",
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Decision::ToolCall { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// 单轮产生的工具调用（临时对象）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Value,
    pub iteration_index: usize,
}

/// 工具失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidArguments,
    ToolNotFound,
    ExecutionError,
    Timeout,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidArguments => "invalid_arguments",
            FailureKind::ToolNotFound => "tool_not_found",
            FailureKind::ExecutionError => "execution_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具调用的统一结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { value: Value },
    Failure { kind: FailureKind, message: String },
}

impl ToolOutcome {
    pub fn success(value: Value) -> Self {
        ToolOutcome::Success { value }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ToolOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ToolOutcome::Failure { kind, .. } => Some(*kind),
            ToolOutcome::Success { .. } => None,
        }
    }

    /// 进度事件里展示的结果类别："success" 或失败类别
    pub fn kind_str(&self) -> &'static str {
        match self {
            ToolOutcome::Success { .. } => "success",
            ToolOutcome::Failure { kind, .. } => kind.as_str(),
        }
    }
}

/// 用户对 needs_input 的一次回答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserExchange {
    pub question: Option<String>,
    pub answer: String,
    pub at: DateTime<Utc>,
}

/// 单轮迭代审计记录（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationLog {
    pub index: usize,
    pub decision: Decision,
    /// 只有工具调用才有结果
    pub outcome: Option<ToolOutcome>,
    pub retry_action: Option<RetryAction>,
    /// 本轮计划变更之后的快照
    pub plan_snapshot: Plan,
    /// 本轮结束后的失败计数
    pub retry_state: RetryState,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// 单次任务执行的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub task_id: String,
    pub task: Task,
    pub status: ExecutionStatus,
    pub iterations: Vec<IterationLog>,
    /// 当前计划（等于最后一条 IterationLog 的快照，或初始计划）
    pub plan: Plan,
    pub retry_state: RetryState,
    pub pending_question: Option<String>,
    #[serde(default)]
    pub interactions: Vec<UserExchange>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// 乐观锁版本号，每次写入 +1
    pub version: u64,
}

impl ExecutionRecord {
    pub fn new(task: Task, plan: Plan) -> Self {
        let now = Utc::now();
        Self {
            id: format!("exec_{}", uuid::Uuid::new_v4()),
            task_id: task.id.clone(),
            task,
            status: ExecutionStatus::Pending,
            iterations: Vec::new(),
            plan,
            retry_state: RetryState::default(),
            pending_question: None,
            interactions: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            output: None,
            error: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn next_index(&self) -> usize {
        self.iterations.len()
    }

    pub fn last_iteration(&self) -> Option<&IterationLog> {
        self.iterations.last()
    }

    /// 最近 N 轮（决策上下文的滑动窗口）
    pub fn recent_iterations(&self, window: usize) -> &[IterationLog] {
        let start = self.iterations.len().saturating_sub(window);
        &self.iterations[start..]
    }

    /// 最后一次成功的工具结果（预算耗尽时作为尽力输出）
    pub fn last_success_value(&self) -> Option<&Value> {
        self.iterations.iter().rev().find_map(|log| match &log.outcome {
            Some(ToolOutcome::Success { value }) => Some(value),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(NeedsInput));
        assert!(NeedsInput.can_transition_to(InProgress));
        assert!(!NeedsInput.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_status_parse_matches_as_str() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::InProgress,
            ExecutionStatus::NeedsInput,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("running"), None);
    }

    #[test]
    fn test_decision_serde_tag() {
        let d = Decision::tool_call("echo", json!({"text": "hi"}));
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["name"], "echo");

        let parsed: Decision =
            serde_json::from_value(json!({"type": "final_answer", "output": "42"})).unwrap();
        assert_eq!(parsed, Decision::final_answer("42"));
    }

    #[test]
    fn test_outcome_kind_str() {
        assert_eq!(ToolOutcome::success(json!(1)).kind_str(), "success");
        let failure = ToolOutcome::failure(FailureKind::Timeout, "slow");
        assert_eq!(failure.kind_str(), "timeout");
        assert_eq!(failure.failure_kind(), Some(FailureKind::Timeout));
        let v = serde_json::to_value(&failure).unwrap();
        assert_eq!(v["status"], "failure");
        assert_eq!(v["kind"], "timeout");
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("user_1", "book a flight")
            .with_max_iterations(5)
            .with_context("city", json!("Paris"))
            .with_linked_external_task("ext-9");
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.max_iterations, 5);
        assert_eq!(task.context["city"], "Paris");
        assert_eq!(task.linked_external_task_id.as_deref(), Some("ext-9"));
    }
}
