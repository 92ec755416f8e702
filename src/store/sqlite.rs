//! SQLite 执行存储（feature = "async-sqlite"）
//!
//! executions 表保存记录头（不含迭代，JSON）与版本号；iterations 表按 (execution_id, idx) 只追加。
//! 写操作在事务内完成：读取 -> 校验版本 -> 变更 -> `UPDATE ... WHERE version = ?`，受影响行数为 0 即版本冲突。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{apply_iteration, apply_status_update, check_version, ExecutionStore, StatusUpdate, StoreError};
use crate::core::{ExecutionRecord, IterationLog, Plan, Task};

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// sqlx 连接池版存储
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&db_url)
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// 内存数据库（单连接，测试用）
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS iterations (
                execution_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                log TEXT NOT NULL,
                PRIMARY KEY (execution_id, idx)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

fn header_json(record: &ExecutionRecord) -> Result<String, StoreError> {
    let mut header = record.clone();
    header.iterations.clear();
    serde_json::to_string(&header).map_err(backend)
}

async fn load_record(conn: &mut SqliteConnection, id: &str) -> Result<ExecutionRecord, StoreError> {
    let row = sqlx::query("SELECT record FROM executions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    let mut record: ExecutionRecord =
        serde_json::from_str(&row.get::<String, _>("record")).map_err(backend)?;

    let rows = sqlx::query("SELECT log FROM iterations WHERE execution_id = ? ORDER BY idx ASC")
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .map_err(backend)?;
    record.iterations = rows
        .iter()
        .map(|r| serde_json::from_str::<IterationLog>(&r.get::<String, _>("log")))
        .collect::<Result<Vec<_>, _>>()
        .map_err(backend)?;
    Ok(record)
}

async fn write_header(
    conn: &mut SqliteConnection,
    record: &ExecutionRecord,
    expected_version: u64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE executions SET status = ?, version = ?, record = ?, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(record.status.as_str())
    .bind(record.version as i64)
    .bind(header_json(record)?)
    .bind(record.updated_at.timestamp_millis())
    .bind(&record.id)
    .bind(expected_version as i64)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    if result.rows_affected() == 0 {
        let stored = sqlx::query("SELECT version FROM executions WHERE id = ?")
            .bind(&record.id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        return Err(StoreError::VersionConflict {
            id: record.id.clone(),
            expected: expected_version,
            actual: stored.get::<i64, _>("version") as u64,
        });
    }
    Ok(())
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_execution(&self, task: &Task, plan: Plan) -> Result<ExecutionRecord, StoreError> {
        let record = ExecutionRecord::new(task.clone(), plan);
        sqlx::query(
            "INSERT INTO executions (id, task_id, status, version, record, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.task_id)
        .bind(record.status.as_str())
        .bind(record.version as i64)
        .bind(header_json(&record)?)
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(record)
    }

    async fn append_iteration(
        &self,
        execution_id: &str,
        expected_version: u64,
        log: &IterationLog,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut record = load_record(&mut tx, execution_id).await?;
        check_version(&record, expected_version)?;
        apply_iteration(&mut record, log)?;

        sqlx::query("INSERT INTO iterations (execution_id, idx, log) VALUES (?, ?, ?)")
            .bind(execution_id)
            .bind(log.index as i64)
            .bind(serde_json::to_string(log).map_err(backend)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        write_header(&mut tx, &record, expected_version).await?;
        tx.commit().await.map_err(backend)?;
        Ok(record.version)
    }

    async fn update_status(
        &self,
        execution_id: &str,
        expected_version: u64,
        update: &StatusUpdate,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut record = load_record(&mut tx, execution_id).await?;
        check_version(&record, expected_version)?;
        apply_status_update(&mut record, update)?;
        write_header(&mut tx, &record, expected_version).await?;
        tx.commit().await.map_err(backend)?;
        Ok(record.version)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        load_record(&mut conn, execution_id).await
    }

    async fn list_unfinished(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM executions
             WHERE status IN ('pending', 'in_progress', 'needs_input')
             ORDER BY updated_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionStatus, PlanManager};

    #[tokio::test]
    async fn test_sqlite_round_trip_and_conflict() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let task = Task::new("u", "goal");
        let plan = PlanManager::new().create_initial("goal", vec![]);
        let record = store.create_execution(&task, plan).await.unwrap();

        let v = store
            .update_status(&record.id, 0, &StatusUpdate::new(ExecutionStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(v, 1);

        let err = store
            .update_status(&record.id, 0, &StatusUpdate::new(ExecutionStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let loaded = store.get_execution(&record.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::InProgress);
        assert_eq!(loaded.task, task);
        assert_eq!(store.list_unfinished().await.unwrap(), vec![record.id]);
    }

    #[tokio::test]
    async fn test_stale_header_write_reports_stored_version() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let plan = PlanManager::new().create_initial("goal", vec![]);
        let record = store
            .create_execution(&Task::new("u", "goal"), plan)
            .await
            .unwrap();
        store
            .update_status(&record.id, 0, &StatusUpdate::new(ExecutionStatus::InProgress))
            .await
            .unwrap();

        let mut stale = record.clone();
        stale.version = 8;
        let mut conn = store.pool.acquire().await.unwrap();
        let err = write_header(&mut *conn, &stale, 7).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                id: record.id.clone(),
                expected: 7,
                actual: 1,
            }
        );
    }
}
