//! 内存版执行存储（默认后端，进程退出即丢失）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{apply_iteration, apply_status_update, check_version, ExecutionStore, StatusUpdate, StoreError};
use crate::core::{ExecutionRecord, IterationLog, Plan, Task};

/// HashMap + RwLock；写操作在写锁内完成版本校验与变更
#[derive(Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 导入一条已有记录（例如从 JSON 快照恢复）；同 ID 会被覆盖
    pub async fn insert(&self, record: ExecutionRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, task: &Task, plan: Plan) -> Result<ExecutionRecord, StoreError> {
        let record = ExecutionRecord::new(task.clone(), plan);
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn append_iteration(
        &self,
        execution_id: &str,
        expected_version: u64,
        log: &IterationLog,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        check_version(record, expected_version)?;
        let mut next = record.clone();
        apply_iteration(&mut next, log)?;
        *record = next;
        Ok(record.version)
    }

    async fn update_status(
        &self,
        execution_id: &str,
        expected_version: u64,
        update: &StatusUpdate,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        check_version(record, expected_version)?;
        apply_status_update(record, update)?;
        Ok(record.version)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
        self.records
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
    }

    async fn list_unfinished(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .map(|r| r.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionStatus, PlanManager};

    async fn seeded() -> (InMemoryExecutionStore, ExecutionRecord) {
        let store = InMemoryExecutionStore::new();
        let task = Task::new("u", "goal");
        let plan = PlanManager::new().create_initial("goal", vec![]);
        let record = store.create_execution(&task, plan).await.unwrap();
        (store, record)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (store, record) = seeded().await;
        let loaded = store.get_execution(&record.id).await.unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert_eq!(store.list_unfinished().await.unwrap(), vec![record.id.clone()]);
    }

    #[tokio::test]
    async fn test_stale_writer_rejected() {
        let (store, record) = seeded().await;
        let v1 = store
            .update_status(&record.id, 0, &StatusUpdate::new(ExecutionStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(v1, 1);

        // 第二个写入者仍持有 version 0
        let err = store
            .update_status(&record.id, 0, &StatusUpdate::new(ExecutionStatus::Cancelled))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, actual: 1, .. }));
        let loaded = store.get_execution(&record.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::InProgress);
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_record_untouched() {
        let (store, record) = seeded().await;
        let err = store
            .update_status(&record.id, 0, &StatusUpdate::new(ExecutionStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let loaded = store.get_execution(&record.id).await.unwrap();
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_missing_execution() {
        let store = InMemoryExecutionStore::new();
        assert!(matches!(
            store.get_execution("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
