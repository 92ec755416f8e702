//! 执行记录器：先写存储、成功后同步本地副本、再推送进度事件
//!
//! 每次写入都带上本地副本的版本号；存储拒绝（版本冲突）时本地副本保持不变，由调用方停止循环。

use std::sync::Arc;

use crate::core::{EventBus, ExecutionRecord, IterationLog, ProgressEvent};
use crate::store::{apply_iteration, apply_status_update, ExecutionStore, StatusUpdate, StoreError};

pub struct ExecutionRecorder {
    store: Arc<dyn ExecutionStore>,
    events: EventBus,
    record: ExecutionRecord,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn ExecutionStore>, events: EventBus, record: ExecutionRecord) -> Self {
        Self {
            store,
            events,
            record,
        }
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    /// 追加一轮迭代日志
    pub async fn append(&mut self, log: IterationLog) -> Result<(), StoreError> {
        let version = self
            .store
            .append_iteration(&self.record.id, self.record.version, &log)
            .await?;
        apply_iteration(&mut self.record, &log)?;
        self.record.version = version;

        tracing::debug!(
            execution_id = %self.record.id,
            iteration = log.index,
            decision = log.decision.kind(),
            outcome = log.outcome.as_ref().map(|o| o.kind_str()).unwrap_or("-"),
            "iteration recorded"
        );
        self.events.emit(ProgressEvent::from_record(&self.record));
        Ok(())
    }

    /// 状态迁移
    pub async fn transition(&mut self, update: StatusUpdate) -> Result<(), StoreError> {
        let from = self.record.status;
        let version = self
            .store
            .update_status(&self.record.id, self.record.version, &update)
            .await?;
        apply_status_update(&mut self.record, &update)?;
        self.record.version = version;

        tracing::info!(
            execution_id = %self.record.id,
            from = %from,
            to = %update.status,
            "execution status changed"
        );
        self.events
            .emit(ProgressEvent::from_record(&self.record).without_iteration());
        Ok(())
    }
}
