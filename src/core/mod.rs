//! 核心编排层：数据模型、计划与重试策略、执行监管、主控循环与构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod plan;
pub mod recorder;
pub mod retry;
pub mod shutdown;
pub mod supervisor;
pub mod types;

pub use builder::{
    build_from_config, build_tool_registry, create_llm_from_config, create_store_from_config,
    OrchestratorBuilder,
};
pub use error::EngineError;
pub use events::{EventBus, ProgressEvent};
pub use orchestrator::{EngineConfig, Orchestrator};
pub use plan::{
    AnySuccess, Phase, PhaseDraft, PhaseEvaluator, PhaseStatus, Plan, PlanDraft, PlanManager,
};
pub use recorder::ExecutionRecorder;
pub use retry::{RetryAction, RetryPolicy, RetryState};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use supervisor::{ExecutionSupervisor, RunLease};
pub use types::{
    Decision, ExecutionId, ExecutionRecord, ExecutionStatus, FailureKind, IterationLog, Task,
    ToolCall, ToolOutcome, UserExchange,
};
