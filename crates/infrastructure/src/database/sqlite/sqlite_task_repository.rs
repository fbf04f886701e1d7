use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use taskengine_core::models::{AbortedTask, ClaimRequest, NewTask, Task};
use taskengine_core::traits::TaskRepository;
use taskengine_core::{EngineError, EngineResult};

const TASK_COLUMNS: &str = "id, node_id, node_group, execution_date, expiration_date, runner, \
     payload, retry_count, lock_owner_node_id, locked_at, created_at";

/// SQLite任务仓储实现
///
/// SQLite没有FOR UPDATE SKIP LOCKED，认领改为先查候选再逐行做
/// 条件更新（仅在锁列仍为空时写入），单写者事务保证每次CAS原子。
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 初始化任务表结构
    pub async fn initialize_schema(pool: &SqlitePool) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER,
                node_group TEXT,
                execution_date DATETIME NOT NULL,
                expiration_date DATETIME,
                runner TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT 'null',
                retry_count INTEGER NOT NULL DEFAULT 0,
                lock_owner_node_id INTEGER,
                locked_at DATETIME,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_execution_date ON tasks (execution_date)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> EngineResult<Task> {
        let payload_text: String = row.try_get("payload")?;
        let payload = serde_json::from_str(&payload_text)
            .map_err(|e| EngineError::Internal(format!("任务payload反序列化失败: {e}")))?;

        Ok(Task {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            node_group: row.try_get("node_group")?,
            execution_date: row.try_get("execution_date")?,
            expiration_date: row.try_get("expiration_date")?,
            runner: row.try_get("runner")?,
            payload,
            retry_count: row.try_get("retry_count")?,
            lock_owner_node_id: row.try_get("lock_owner_node_id")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &NewTask) -> EngineResult<Task> {
        let execution_date = task
            .execution_date
            .ok_or_else(|| EngineError::InvalidTask("任务缺少执行时间".to_string()))?;

        let payload_text = serde_json::to_string(&task.payload)
            .map_err(|e| EngineError::Internal(format!("任务payload序列化失败: {e}")))?;

        let row = sqlx::query(&format!(
            "INSERT INTO tasks (node_id, node_group, execution_date, expiration_date, runner, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.node_id)
        .bind(&task.node_group)
        .bind(execution_date)
        .bind(task.expiration_date)
        .bind(&task.runner)
        .bind(payload_text)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_task(&row)?;
        debug!("创建任务成功: ID {}, 运行器 {}", created.id, created.runner);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn delete(&self, id: i64) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn delete_if_unlocked(&self, id: i64) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1 AND lock_owner_node_id IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due_tasks(&self, claim: &ClaimRequest) -> EngineResult<Vec<Task>> {
        if claim.max_items == 0 {
            return Ok(Vec::new());
        }

        // 候选查询不含组过滤（SQLite不便绑定数组），组匹配在内存里做，
        // 真正的互斥由随后的逐行条件更新保证
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE lock_owner_node_id IS NULL \
               AND execution_date <= ?1 \
               AND (node_id IS NULL OR node_id = ?2) \
             ORDER BY execution_date"
        ))
        .bind(claim.now)
        .bind(claim.node_id)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::new();
        for row in &rows {
            if claimed.len() >= claim.max_items {
                break;
            }

            let candidate = Self::row_to_task(row)?;
            if !candidate.matches_node(claim.node_id, &claim.node_groups) {
                continue;
            }
            if claim.exclusive && !candidate.is_assigned() {
                continue;
            }

            // 条件更新：锁列仍为空才认领成功，输掉竞争的行直接跳过
            let result = sqlx::query(
                "UPDATE tasks SET lock_owner_node_id = ?1, locked_at = ?2 \
                 WHERE id = ?3 AND lock_owner_node_id IS NULL",
            )
            .bind(claim.node_id)
            .bind(claim.now)
            .bind(candidate.id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                claimed.push(Task {
                    lock_owner_node_id: Some(claim.node_id),
                    locked_at: Some(claim.now),
                    ..candidate
                });
            }
        }

        if !claimed.is_empty() {
            debug!("节点 {} 认领了 {} 个任务", claim.node_id, claimed.len());
        }
        Ok(claimed)
    }

    async fn reschedule(
        &self,
        id: i64,
        next_execution: DateTime<Utc>,
        retry_count: i32,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET execution_date = ?2, retry_count = ?3, \
             lock_owner_node_id = NULL, locked_at = NULL WHERE id = ?1",
        )
        .bind(id)
        .bind(next_execution)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn release_node_locks(&self, node_id: i32) -> EngineResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET lock_owner_node_id = NULL, locked_at = NULL \
             WHERE lock_owner_node_id = ?1",
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn unlock_tasks_for_nodes(&self, node_ids: &[i32]) -> EngineResult<Vec<AbortedTask>> {
        let mut aborted = Vec::new();
        for &node_id in node_ids {
            let rows = sqlx::query("SELECT id FROM tasks WHERE lock_owner_node_id = ?1")
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?;

            for row in &rows {
                let task_id: i64 = row.try_get("id")?;
                let result = sqlx::query(
                    "UPDATE tasks SET lock_owner_node_id = NULL, locked_at = NULL \
                     WHERE id = ?1 AND lock_owner_node_id = ?2",
                )
                .bind(task_id)
                .bind(node_id)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 1 {
                    aborted.push(AbortedTask { task_id, node_id });
                }
            }
        }
        Ok(aborted)
    }
}
