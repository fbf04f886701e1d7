use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use taskengine_core::models::{AbortedTask, ClaimRequest, NewTask, Task};
use taskengine_core::traits::TaskRepository;
use taskengine_core::{EngineError, EngineResult};

const TASK_COLUMNS: &str = "id, node_id, node_group, execution_date, expiration_date, runner, \
     payload, retry_count, lock_owner_node_id, locked_at, created_at";

/// PostgreSQL任务仓储实现
///
/// 认领通过单条UPDATE..RETURNING完成，配合FOR UPDATE SKIP LOCKED
/// 让并发认领的节点互不阻塞也不会抢到同一行。
pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 初始化任务表结构
    pub async fn initialize_schema(pool: &PgPool) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BIGSERIAL PRIMARY KEY,
                node_id INTEGER,
                node_group TEXT,
                execution_date TIMESTAMPTZ NOT NULL,
                expiration_date TIMESTAMPTZ,
                runner TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT 'null',
                retry_count INTEGER NOT NULL DEFAULT 0,
                lock_owner_node_id INTEGER,
                locked_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim \
             ON tasks (execution_date) WHERE lock_owner_node_id IS NULL",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_lock_owner \
             ON tasks (lock_owner_node_id) WHERE lock_owner_node_id IS NOT NULL",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> EngineResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            node_group: row.try_get("node_group")?,
            execution_date: row.try_get("execution_date")?,
            expiration_date: row.try_get("expiration_date")?,
            runner: row.try_get("runner")?,
            payload: row.try_get("payload")?,
            retry_count: row.try_get("retry_count")?,
            lock_owner_node_id: row.try_get("lock_owner_node_id")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[instrument(skip(self, task), fields(runner = %task.runner))]
    async fn create(&self, task: &NewTask) -> EngineResult<Task> {
        let execution_date = task
            .execution_date
            .ok_or_else(|| EngineError::InvalidTask("任务缺少执行时间".to_string()))?;

        let row = sqlx::query(&format!(
            "INSERT INTO tasks (node_id, node_group, execution_date, expiration_date, runner, payload) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.node_id)
        .bind(&task.node_group)
        .bind(execution_date)
        .bind(task.expiration_date)
        .bind(&task.runner)
        .bind(&task.payload)
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_task(&row)?;
        debug!("创建任务成功: ID {}, 运行器 {}", created.id, created.runner);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn delete(&self, id: i64) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn delete_if_unlocked(&self, id: i64) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND lock_owner_node_id IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, claim), fields(node_id = %claim.node_id, max_items = %claim.max_items))]
    async fn claim_due_tasks(&self, claim: &ClaimRequest) -> EngineResult<Vec<Task>> {
        if claim.max_items == 0 {
            return Ok(Vec::new());
        }

        // 独占模式额外要求任务至少带有一个亲和性约束，
        // 未分配的任务在独占模式下不会被任何节点认领
        let exclusive_clause = if claim.exclusive {
            "AND (node_id IS NOT NULL OR node_group IS NOT NULL)"
        } else {
            ""
        };

        let sql = format!(
            "UPDATE tasks SET lock_owner_node_id = $1, locked_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM tasks \
                 WHERE lock_owner_node_id IS NULL \
                   AND execution_date <= $2 \
                   AND (node_id IS NULL OR node_id = $1) \
                   AND (node_group IS NULL OR node_group = ANY($3)) \
                   {exclusive_clause} \
                 ORDER BY execution_date \
                 LIMIT $4 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {TASK_COLUMNS}"
        );

        let rows = sqlx::query(&sql)
            .bind(claim.node_id)
            .bind(claim.now)
            .bind(&claim.node_groups)
            .bind(claim.max_items as i64)
            .fetch_all(&self.pool)
            .await?;

        let claimed: Vec<Task> = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<EngineResult<_>>()?;

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
            "UPDATE tasks SET execution_date = $2, retry_count = $3, \
             lock_owner_node_id = NULL, locked_at = NULL WHERE id = $1",
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
             WHERE lock_owner_node_id = $1",
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn unlock_tasks_for_nodes(&self, node_ids: &[i32]) -> EngineResult<Vec<AbortedTask>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }

        // RETURNING只能读到更新后的值，原持有者通过自连接取旧行
        let rows = sqlx::query(
            "UPDATE tasks t SET lock_owner_node_id = NULL, locked_at = NULL \
             FROM (SELECT id, lock_owner_node_id FROM tasks \
                   WHERE lock_owner_node_id = ANY($1) FOR UPDATE) old \
             WHERE t.id = old.id \
             RETURNING t.id AS task_id, old.lock_owner_node_id AS owner_node_id",
        )
        .bind(node_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut aborted = Vec::with_capacity(rows.len());
        for row in &rows {
            aborted.push(AbortedTask {
                task_id: row.try_get("task_id")?,
                node_id: row.try_get("owner_node_id")?,
            });
        }
        Ok(aborted)
    }
}
