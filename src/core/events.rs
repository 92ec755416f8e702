//! 进度事件：供 CLI / UI 订阅的执行过程推送
//!
//! 至少一次投递；消费方按 (execution_id, iteration) 去重。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::{ExecutionId, ExecutionRecord, ExecutionStatus};

/// 单条进度事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub execution_id: ExecutionId,
    /// 状态迁移事件没有迭代序号
    pub iteration: Option<usize>,
    pub status: ExecutionStatus,
    pub phase_title: Option<String>,
    pub last_tool_name: Option<String>,
    pub last_outcome_kind: Option<String>,
}

impl ProgressEvent {
    /// 从记录当前状态投影出事件（取最后一轮的工具与结果）
    pub fn from_record(record: &ExecutionRecord) -> Self {
        let last = record.last_iteration();
        Self {
            execution_id: record.id.clone(),
            iteration: last.map(|l| l.index),
            status: record.status,
            phase_title: record.plan.active_phase().map(|p| p.title.clone()),
            last_tool_name: last
                .and_then(|l| l.decision.tool_name())
                .map(str::to_string),
            last_outcome_kind: last
                .and_then(|l| l.outcome.as_ref())
                .map(|o| o.kind_str().to_string()),
        }
    }

    pub fn without_iteration(mut self) -> Self {
        self.iteration = None;
        self
    }
}

/// 进度事件总线（broadcast，无订阅者时丢弃）
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        tracing::debug!(
            execution_id = %event.execution_id,
            iteration = ?event.iteration,
            status = %event.status,
            "progress"
        );
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlanManager, Task};

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let task = Task::new("u", "do it");
        let plan = PlanManager::new().create_initial("do it", vec![]);
        let record = ExecutionRecord::new(task, plan);

        bus.emit(ProgressEvent::from_record(&record));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.execution_id, record.id);
        assert_eq!(ev.status, ExecutionStatus::Pending);
        assert_eq!(ev.phase_title.as_deref(), Some("do it"));
        assert!(ev.iteration.is_none());
    }

    #[test]
    fn test_emit_without_subscriber_is_noop() {
        let bus = EventBus::default();
        let task = Task::new("u", "x");
        let plan = PlanManager::new().create_initial("x", vec![]);
        bus.emit(ProgressEvent::from_record(&ExecutionRecord::new(task, plan)));
    }
}
