//! 主控循环：决策 -> 执行工具 -> 重试策略 -> 推进计划 -> 记录，直到终态、暂停、取消或预算耗尽
//!
//! 每个执行一个独立的 tokio 任务，迭代严格串行；多个执行并发运行，只共享只读工具注册表、
//! 推理端与存储。控制面（start / cancel / resume_with_input / get_status / wait / recover / shutdown）
//! 只通过存储与执行监管交互，从不直接修改循环持有的记录。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSection;
use crate::core::recorder::ExecutionRecorder;
use crate::core::retry::escalation_question;
use crate::core::supervisor::{wait_done, ExecutionSupervisor, RunLease};
use crate::core::{
    Decision, EngineError, EventBus, ExecutionId, ExecutionRecord, ExecutionStatus, FailureKind,
    IterationLog, PhaseEvaluator, Plan, PlanManager, ProgressEvent, RetryAction, RetryPolicy, RetryState,
    Task, ToolCall, ToolOutcome,
};
use crate::reasoning::{DecisionContext, ReasoningClient};
use crate::store::{ExecutionStore, StatusUpdate, StoreError};
use crate::tools::{DispatchContext, ToolDefinition, ToolDispatcher};

/// 引擎参数（来自 [engine] 配置段）
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 任务未指定预算时使用
    pub max_iterations: usize,
    pub history_window: usize,
    pub reasoning_max_attempts: u32,
    pub reasoning_backoff: Duration,
    pub retry_policy: RetryPolicy,
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            max_iterations: section.max_iterations.max(1),
            history_window: section.history_window,
            reasoning_max_attempts: section.reasoning_max_attempts.max(1),
            reasoning_backoff: section.reasoning_backoff(),
            retry_policy: RetryPolicy::new(
                section.max_consecutive_failures,
                section.max_timeout_retries,
            ),
            event_buffer: section.event_buffer,
        }
    }
}

/// 单轮结束后循环的去向
enum Step {
    Continue,
    Complete(Value),
    Pause(String),
    Fail(String),
    Cancel,
}

enum DecideFailure {
    Cancelled,
    Exhausted(EngineError),
}

pub(crate) struct Engine {
    pub(crate) dispatcher: ToolDispatcher,
    pub(crate) reasoning: Arc<dyn ReasoningClient>,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) evaluator: Arc<dyn PhaseEvaluator>,
    pub(crate) plans: PlanManager,
    pub(crate) events: EventBus,
    pub(crate) supervisor: ExecutionSupervisor,
    pub(crate) tool_definitions: Vec<ToolDefinition>,
    pub(crate) config: EngineConfig,
}

/// 编排器句柄（clone 代价低，可在多个任务间共享）
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
}

impl Orchestrator {
    pub(crate) fn from_engine(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// 创建执行记录并在后台启动循环，立即返回执行 ID
    pub async fn start(&self, task: Task) -> Result<ExecutionId, EngineError> {
        let plan = match &task.initial_plan {
            Some(draft) => self
                .engine
                .plans
                .create_initial(draft.goal.clone(), draft.phases.clone()),
            None => self
                .engine
                .plans
                .create_initial(task.description.clone(), Vec::new()),
        };
        let record = self.engine.store.create_execution(&task, plan).await?;
        let id = record.id.clone();
        tracing::info!(execution_id = %id, task_id = %task.id, "execution created");
        self.engine
            .events
            .emit(ProgressEvent::from_record(&record).without_iteration());

        let lease = self
            .engine
            .supervisor
            .claim(&id)
            .ok_or_else(|| EngineError::ExecutionAlreadyRunning(id.clone()))?;
        let recorder = self.recorder(record);
        self.spawn(recorder, lease);
        Ok(id)
    }

    /// 启动并等待执行结束（终态或 needs_input）
    pub async fn run(&self, task: Task) -> Result<ExecutionRecord, EngineError> {
        let id = self.start(task).await?;
        self.wait(&id).await
    }

    /// 取消执行；可重复调用，终态执行直接返回
    pub async fn cancel(&self, id: &str) -> Result<(), EngineError> {
        for _ in 0..3 {
            if self.engine.supervisor.cancel(id) {
                tracing::info!(execution_id = %id, "cancellation requested");
                // 循环可能已写完 needs_input 正在退出，令牌无人读取：等它释放后再看存储
                self.wait_released(id).await;
            }

            // 没有活跃循环：pending / needs_input / 崩溃遗留的 in_progress 直接在存储中迁移
            let record = self.engine.store.get_execution(id).await?;
            if record.is_terminal() {
                return Ok(());
            }
            let mut recorder = self.recorder(record);
            match recorder
                .transition(StatusUpdate::new(ExecutionStatus::Cancelled))
                .await
            {
                Ok(()) => return Ok(()),
                // 恢复或启动与取消竞争：下一轮交给新循环的令牌
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::ExecutionAlreadyRunning(id.to_string()))
    }

    /// 用户回答 needs_input 的问题并继续执行（计划与迭代计数保持不变，失败计数清零）
    pub async fn resume_with_input(
        &self,
        id: &str,
        input: impl Into<String>,
    ) -> Result<(), EngineError> {
        let record = self.engine.store.get_execution(id).await?;
        if record.status != ExecutionStatus::NeedsInput {
            return Err(EngineError::NotAwaitingInput {
                id: id.to_string(),
                status: record.status,
            });
        }
        // needs_input 已落盘，仍登记的循环只剩退出
        self.wait_released(id).await;
        let lease = self
            .engine
            .supervisor
            .claim(id)
            .ok_or_else(|| EngineError::ExecutionAlreadyRunning(id.to_string()))?;

        let mut recorder = self.recorder(record);
        recorder
            .transition(
                StatusUpdate::new(ExecutionStatus::InProgress)
                    .with_answer(input)
                    .with_retry_state(RetryState::default()),
            )
            .await?;
        tracing::info!(execution_id = %id, "execution resumed with user input");
        self.spawn(recorder, lease);
        Ok(())
    }

    pub async fn get_status(&self, id: &str) -> Result<ExecutionRecord, EngineError> {
        Ok(self.engine.store.get_execution(id).await?)
    }

    /// 等待活跃循环退出后返回最新记录；没有活跃循环时立即返回
    pub async fn wait(&self, id: &str) -> Result<ExecutionRecord, EngineError> {
        self.wait_released(id).await;
        self.get_status(id).await
    }

    async fn wait_released(&self, id: &str) {
        if let Some(rx) = self.engine.supervisor.waiter(id) {
            wait_done(rx).await;
        }
    }

    /// 崩溃恢复：为存储中 pending / in_progress 且没有活跃循环的执行重新启动循环。
    /// 返回是否启动了循环（needs_input 等待用户，终态无事可做）。
    pub async fn recover(&self, id: &str) -> Result<bool, EngineError> {
        let record = self.engine.store.get_execution(id).await?;
        if !matches!(
            record.status,
            ExecutionStatus::Pending | ExecutionStatus::InProgress
        ) {
            return Ok(false);
        }
        let lease = self
            .engine
            .supervisor
            .claim(id)
            .ok_or_else(|| EngineError::ExecutionAlreadyRunning(id.to_string()))?;
        tracing::info!(
            execution_id = %id,
            next_iteration = record.next_index(),
            "recovering execution"
        );
        let recorder = self.recorder(record);
        self.spawn(recorder, lease);
        Ok(true)
    }

    /// 恢复存储中所有未完成的执行，返回重新启动的执行 ID
    pub async fn recover_all(&self) -> Result<Vec<ExecutionId>, EngineError> {
        let mut recovered = Vec::new();
        for id in self.engine.store.list_unfinished().await? {
            if self.engine.supervisor.is_active(&id) {
                continue;
            }
            if self.recover(&id).await? {
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.engine.events.subscribe()
    }

    pub fn tool_definitions(&self) -> &[ToolDefinition] {
        &self.engine.tool_definitions
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.engine.supervisor.is_active(id)
    }

    /// 取消所有活跃循环并等待它们写完终态
    pub async fn shutdown(&self) {
        let waiters: Vec<_> = self
            .engine
            .supervisor
            .active_ids()
            .iter()
            .filter_map(|id| self.engine.supervisor.waiter(id))
            .collect();
        tracing::info!(active = waiters.len(), "shutting down orchestrator");
        self.engine.supervisor.shutdown();
        futures_util::future::join_all(waiters.into_iter().map(wait_done)).await;
    }

    fn recorder(&self, record: ExecutionRecord) -> ExecutionRecorder {
        ExecutionRecorder::new(
            self.engine.store.clone(),
            self.engine.events.clone(),
            record,
        )
    }

    fn spawn(&self, recorder: ExecutionRecorder, lease: RunLease) {
        let engine = self.engine.clone();
        tokio::spawn(async move { engine.drive(recorder, lease).await });
    }
}

impl Engine {
    /// 循环外壳：版本冲突说明已有别的写入者，直接退出；其他存储错误尽量把执行标记为 failed
    async fn drive(self: Arc<Self>, mut recorder: ExecutionRecorder, lease: RunLease) {
        let id = recorder.record().id.clone();
        match self.run_loop(&mut recorder, lease.token()).await {
            Ok(()) => {
                let record = recorder.record();
                tracing::info!(
                    execution_id = %id,
                    status = %record.status,
                    iterations = record.iterations.len(),
                    "execution loop exited"
                );
            }
            Err(e @ StoreError::VersionConflict { .. }) => {
                tracing::error!(execution_id = %id, error = %e, "lost execution ownership, loop stopped");
            }
            Err(e) => {
                tracing::error!(execution_id = %id, error = %e, "store write failed");
                if !recorder.record().is_terminal() {
                    let update = StatusUpdate::new(ExecutionStatus::Failed).with_error(e.to_string());
                    if let Err(e) = recorder.transition(update).await {
                        tracing::error!(execution_id = %id, error = %e, "failed to mark execution failed");
                    }
                }
            }
        }
        drop(lease);
    }

    fn budget_for(&self, task: &Task) -> usize {
        if task.max_iterations > 0 {
            task.max_iterations
        } else {
            self.config.max_iterations
        }
    }

    async fn run_loop(
        &self,
        recorder: &mut ExecutionRecorder,
        token: &CancellationToken,
    ) -> Result<(), StoreError> {
        if recorder.record().status == ExecutionStatus::Pending {
            recorder
                .transition(StatusUpdate::new(ExecutionStatus::InProgress))
                .await?;
        }
        let budget = self.budget_for(&recorder.record().task);

        loop {
            let index = recorder.record().next_index();

            if index >= budget {
                let output = recorder
                    .record()
                    .last_success_value()
                    .cloned()
                    .unwrap_or(Value::Null);
                tracing::warn!(execution_id = %recorder.record().id, budget, "iteration budget exhausted");
                return recorder
                    .transition(
                        StatusUpdate::new(ExecutionStatus::Timeout)
                            .with_output(output)
                            .with_error(EngineError::IterationBudgetExceeded(budget).to_string()),
                    )
                    .await;
            }

            if token.is_cancelled() {
                return Self::finish_cancelled(recorder).await;
            }

            let ctx = self.decision_context(recorder.record(), index, budget);
            let started = Instant::now();
            let decision = match self.decide_with_retry(&ctx, token).await {
                Ok(decision) => decision,
                Err(DecideFailure::Cancelled) => return Self::finish_cancelled(recorder).await,
                Err(DecideFailure::Exhausted(e)) => {
                    tracing::error!(execution_id = %ctx.execution_id, error = %e, "reasoning client exhausted retries");
                    return recorder
                        .transition(
                            StatusUpdate::new(ExecutionStatus::Failed).with_error(e.to_string()),
                        )
                        .await;
                }
            };
            tracing::debug!(
                execution_id = %ctx.execution_id,
                iteration = index,
                decision = decision.kind(),
                "decision received"
            );

            let mut plan = recorder.record().plan.clone();
            let mut retry_state = recorder.record().retry_state.clone();
            let mut outcome = None;
            let mut retry_action = None;

            let step = match &decision {
                Decision::FinalAnswer { output } => Step::Complete(output.clone()),
                Decision::AskUser { question } => Step::Pause(question.clone()),
                Decision::UpdatePlan { phases } => {
                    match self.plans.replace(&mut plan, phases.clone()) {
                        Ok(()) => tracing::info!(
                            execution_id = %ctx.execution_id,
                            phases = plan.phases.len(),
                            "plan replaced"
                        ),
                        Err(e) => tracing::warn!(execution_id = %ctx.execution_id, error = %e, "plan replacement rejected"),
                    }
                    Step::Continue
                }
                Decision::ToolCall { name, args } => {
                    let call = ToolCall {
                        tool_name: name.clone(),
                        arguments: args.clone(),
                        iteration_index: index,
                    };
                    let timeout_override = retry_state
                        .timeout_override_ms(name)
                        .map(Duration::from_millis);
                    let mut dispatch = DispatchContext::new(token.clone())
                        .for_iteration(ctx.execution_id.clone(), index);
                    if let Some(timeout) = timeout_override {
                        dispatch = dispatch.with_timeout(timeout);
                    }

                    self.plans.lock_for_call(&mut plan, name);
                    let result = self.dispatcher.execute(dispatch, name, args.clone()).await;
                    self.plans.unlock(&mut plan);

                    retry_state.record(&result);
                    let action = self.config.retry_policy.evaluate(&result, &retry_state);
                    let step = match &action {
                        RetryAction::Continue => {
                            if let ToolOutcome::Success { value } = &result {
                                self.on_success(&mut plan, &call, value);
                            }
                            Step::Continue
                        }
                        RetryAction::Retry { extend_timeout } => {
                            if *extend_timeout {
                                let base = timeout_override
                                    .unwrap_or_else(|| self.dispatcher.timeout_for(name));
                                retry_state
                                    .timeout_overrides
                                    .insert(name.clone(), base.as_millis() as u64 * 2);
                            }
                            tracing::warn!(
                                execution_id = %ctx.execution_id,
                                tool = %name,
                                outcome = result.kind_str(),
                                failures = retry_state.consecutive_failures,
                                "tool failed, retrying"
                            );
                            Step::Continue
                        }
                        RetryAction::Escalate => {
                            Step::Pause(escalation_question(name, &result, &retry_state))
                        }
                        RetryAction::Abort => match &result {
                            ToolOutcome::Failure {
                                kind: FailureKind::Cancelled,
                                ..
                            } => Step::Cancel,
                            ToolOutcome::Failure { message, .. } => {
                                self.plans.fail_current_phase(&mut plan, message.clone());
                                Step::Fail(message.clone())
                            }
                            ToolOutcome::Success { .. } => Step::Continue,
                        },
                    };
                    outcome = Some(result);
                    retry_action = Some(action);
                    step
                }
            };

            recorder
                .append(IterationLog {
                    index,
                    decision,
                    outcome,
                    retry_action,
                    plan_snapshot: plan,
                    retry_state,
                    timestamp: Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                })
                .await?;

            match step {
                Step::Continue => continue,
                Step::Complete(output) => {
                    return recorder
                        .transition(StatusUpdate::new(ExecutionStatus::Completed).with_output(output))
                        .await
                }
                Step::Pause(question) => {
                    return recorder
                        .transition(
                            StatusUpdate::new(ExecutionStatus::NeedsInput).with_question(question),
                        )
                        .await
                }
                Step::Fail(message) => {
                    return recorder
                        .transition(StatusUpdate::new(ExecutionStatus::Failed).with_error(message))
                        .await
                }
                Step::Cancel => return Self::finish_cancelled(recorder).await,
            }
        }
    }

    /// 成功的工具调用：满足当前阶段标准则推进；已是最后一个阶段则关闭它，下一轮请求最终答案
    fn on_success(&self, plan: &mut Plan, call: &ToolCall, value: &Value) {
        let satisfied = plan
            .active_phase()
            .is_some_and(|phase| self.evaluator.is_satisfied(phase, call, value));
        if !satisfied {
            return;
        }
        match self.plans.advance_phase(plan) {
            Ok(phase_id) => tracing::debug!(phase_id, "phase advanced"),
            Err(EngineError::NoMorePhases) => {
                self.plans.complete_current(plan);
                tracing::debug!("plan finished, requesting final answer");
            }
            Err(e) => tracing::warn!(error = %e, "phase advance failed"),
        }
    }

    async fn finish_cancelled(recorder: &mut ExecutionRecorder) -> Result<(), StoreError> {
        recorder
            .transition(StatusUpdate::new(ExecutionStatus::Cancelled))
            .await
    }

    fn decision_context(&self, record: &ExecutionRecord, index: usize, budget: usize) -> DecisionContext {
        DecisionContext {
            execution_id: record.id.clone(),
            task_description: record.task.description.clone(),
            task_context: record.task.context.clone(),
            plan: record.plan.clone(),
            recent_iterations: record.recent_iterations(self.config.history_window).to_vec(),
            available_tools: self.tool_definitions.clone(),
            iteration_index: index,
            remaining_iterations: budget.saturating_sub(index),
            conclusion_requested: record.plan.is_exhausted(),
            interactions: record.interactions.clone(),
        }
    }

    /// 推理端调用：失败按指数退避重试，期间可被取消
    async fn decide_with_retry(
        &self,
        ctx: &DecisionContext,
        token: &CancellationToken,
    ) -> Result<Decision, DecideFailure> {
        let attempts = self.config.reasoning_max_attempts.max(1);
        let mut backoff = self.config.reasoning_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DecideFailure::Cancelled),
                result = self.reasoning.decide(ctx) => result,
            };
            match result {
                Ok(decision) => return Ok(decision),
                Err(e) => {
                    tracing::warn!(
                        execution_id = %ctx.execution_id,
                        attempt,
                        error = %e,
                        "reasoning call failed"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(DecideFailure::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2);
            }
        }
        Err(DecideFailure::Exhausted(EngineError::ReasoningUnavailable {
            attempts,
            message: last_error,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSection;

    #[test]
    fn test_engine_config_from_section() {
        let section = EngineSection {
            max_iterations: 0,
            reasoning_max_attempts: 0,
            reasoning_backoff_ms: 5,
            ..EngineSection::default()
        };
        let config = EngineConfig::from(&section);
        assert_eq!(config.max_iterations, 1);
        assert_eq!(config.reasoning_max_attempts, 1);
        assert_eq!(config.reasoning_backoff, Duration::from_millis(5));
        assert_eq!(config.history_window, 8);
    }
}
