//! 重试策略
//!
//! 根据工具结果与连续失败计数给出 RetryAction：继续 / 重试 / 升级为询问用户 / 终止。
//! 纯函数，不做 I/O；计数的更新由 RetryState::record 完成，成功时清零。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{FailureKind, ToolOutcome};

/// 参数错误与执行错误的最大连续尝试次数，超过后询问用户
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// 超时后加倍超时重试的次数
pub const DEFAULT_MAX_TIMEOUT_RETRIES: u32 = 1;

/// 失败计数（随 IterationLog 持久化，恢复执行时沿用）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub consecutive_failures: u32,
    pub consecutive_timeouts: u32,
    /// 工具名 -> 加倍后的超时（毫秒）
    #[serde(default)]
    pub timeout_overrides: BTreeMap<String, u64>,
}

impl RetryState {
    /// 记录一次工具结果：成功清零，失败累加；非超时失败会打断连续超时计数
    pub fn record(&mut self, outcome: &ToolOutcome) {
        match outcome.failure_kind() {
            None => self.reset(),
            Some(kind) => {
                self.consecutive_failures += 1;
                if kind == FailureKind::Timeout {
                    self.consecutive_timeouts += 1;
                } else {
                    self.consecutive_timeouts = 0;
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_timeouts = 0;
        self.timeout_overrides.clear();
    }

    pub fn timeout_override_ms(&self, tool: &str) -> Option<u64> {
        self.timeout_overrides.get(tool).copied()
    }
}

/// 策略给出的动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RetryAction {
    /// 成功，继续下一轮
    Continue,
    /// 不推进计划，再来一轮；extend_timeout 表示该工具下次使用加倍超时
    Retry { extend_timeout: bool },
    /// 暂停并询问用户
    Escalate,
    /// 终止任务
    Abort,
}

impl RetryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryAction::Continue => "continue",
            RetryAction::Retry { .. } => "retry",
            RetryAction::Escalate => "escalate",
            RetryAction::Abort => "abort",
        }
    }
}

/// 重试策略：失败类别 + 计数 -> 动作
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_consecutive_failures: u32,
    max_timeout_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_MAX_TIMEOUT_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_consecutive_failures: u32, max_timeout_retries: u32) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            max_timeout_retries,
        }
    }

    /// counters 需已包含本次结果（先 RetryState::record 再 evaluate）
    pub fn evaluate(&self, outcome: &ToolOutcome, counters: &RetryState) -> RetryAction {
        let kind = match outcome.failure_kind() {
            None => return RetryAction::Continue,
            Some(kind) => kind,
        };
        match kind {
            FailureKind::ToolNotFound | FailureKind::Cancelled => RetryAction::Abort,
            FailureKind::InvalidArguments | FailureKind::ExecutionError => {
                if counters.consecutive_failures < self.max_consecutive_failures {
                    RetryAction::Retry {
                        extend_timeout: false,
                    }
                } else {
                    RetryAction::Escalate
                }
            }
            FailureKind::Timeout => {
                if counters.consecutive_timeouts <= self.max_timeout_retries
                    && counters.consecutive_failures < self.max_consecutive_failures
                {
                    RetryAction::Retry {
                        extend_timeout: true,
                    }
                } else {
                    RetryAction::Escalate
                }
            }
        }
    }
}

/// 升级时合成给用户的问题
pub fn escalation_question(tool: &str, outcome: &ToolOutcome, counters: &RetryState) -> String {
    let detail = match outcome {
        ToolOutcome::Failure { kind, message } => format!("{kind}: {message}"),
        ToolOutcome::Success { .. } => "unknown".to_string(),
    };
    format!(
        "工具 '{tool}' 已连续失败 {} 次（最近一次 {detail}）。请给出指导：修改参数后重试、换一种做法，还是放弃该任务？",
        counters.consecutive_failures
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fail(kind: FailureKind) -> ToolOutcome {
        ToolOutcome::failure(kind, "boom")
    }

    #[test]
    fn test_execution_error_retry_retry_escalate() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        let mut actions = Vec::new();
        for _ in 0..3 {
            let outcome = fail(FailureKind::ExecutionError);
            state.record(&outcome);
            actions.push(policy.evaluate(&outcome, &state));
        }
        assert_eq!(
            actions,
            vec![
                RetryAction::Retry {
                    extend_timeout: false
                },
                RetryAction::Retry {
                    extend_timeout: false
                },
                RetryAction::Escalate,
            ]
        );
    }

    #[test]
    fn test_success_resets_counters() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        state.record(&fail(FailureKind::InvalidArguments));
        state.record(&fail(FailureKind::InvalidArguments));
        state.timeout_overrides.insert("shell".into(), 60_000);

        let ok = ToolOutcome::success(json!("done"));
        state.record(&ok);
        assert_eq!(policy.evaluate(&ok, &state), RetryAction::Continue);
        assert_eq!(state, RetryState::default());

        let outcome = fail(FailureKind::InvalidArguments);
        state.record(&outcome);
        assert!(matches!(
            policy.evaluate(&outcome, &state),
            RetryAction::Retry { .. }
        ));
    }

    #[test]
    fn test_tool_not_found_aborts_regardless_of_count() {
        let policy = RetryPolicy::default();
        let outcome = fail(FailureKind::ToolNotFound);
        let mut state = RetryState::default();
        state.record(&outcome);
        assert_eq!(policy.evaluate(&outcome, &state), RetryAction::Abort);

        let mut busy = RetryState {
            consecutive_failures: 2,
            ..Default::default()
        };
        busy.record(&outcome);
        assert_eq!(policy.evaluate(&outcome, &busy), RetryAction::Abort);
    }

    #[test]
    fn test_cancelled_aborts() {
        let policy = RetryPolicy::default();
        let outcome = fail(FailureKind::Cancelled);
        let mut state = RetryState::default();
        state.record(&outcome);
        assert_eq!(policy.evaluate(&outcome, &state), RetryAction::Abort);
    }

    #[test]
    fn test_timeout_retries_once_then_escalates() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        let outcome = fail(FailureKind::Timeout);

        state.record(&outcome);
        assert_eq!(
            policy.evaluate(&outcome, &state),
            RetryAction::Retry {
                extend_timeout: true
            }
        );
        state.record(&outcome);
        assert_eq!(policy.evaluate(&outcome, &state), RetryAction::Escalate);
    }

    #[test]
    fn test_escalation_question_mentions_tool() {
        let mut state = RetryState::default();
        let outcome = fail(FailureKind::ExecutionError);
        state.record(&outcome);
        let q = escalation_question("browser_click", &outcome, &state);
        assert!(q.contains("browser_click"));
        assert!(q.contains("execution_error"));
    }
}
