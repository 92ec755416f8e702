//! 脚本化推理端：按顺序返回预置决策，记录每次收到的上下文（测试与回放用）

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::Decision;
use crate::reasoning::{DecisionContext, ReasoningClient, ReasoningError};

#[derive(Default)]
pub struct ScriptedReasoningClient {
    script: Mutex<VecDeque<Result<Decision, ReasoningError>>>,
    seen: Mutex<Vec<DecisionContext>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedReasoningClient {
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self::from_results(decisions.into_iter().map(Ok))
    }

    /// 允许在脚本中插入推理失败
    pub fn from_results(results: impl IntoIterator<Item = Result<Decision, ReasoningError>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 每次决策前等待一段时间（模拟慢推理端）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 在脚本末尾追加决策（恢复执行前补充剧本）
    pub fn push(&self, decision: Decision) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(decision));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 已收到的全部上下文（按调用顺序）
    pub fn contexts(&self) -> Vec<DecisionContext> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoningClient {
    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision, ReasoningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(ctx.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .map_err(|e| ReasoningError::Unavailable(e.to_string()))?
            .pop_front();
        next.unwrap_or_else(|| Err(ReasoningError::Unavailable("script exhausted".to_string())))
    }
}
