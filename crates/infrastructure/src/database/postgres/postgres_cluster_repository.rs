use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use taskengine_core::models::ClusterNodeInfo;
use taskengine_core::traits::ClusterRepository;
use taskengine_core::EngineResult;

/// 集群服务的缺省节点失联超时
const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_millis(90_000);

/// PostgreSQL集群成员仓储实现
pub struct PostgresClusterRepository {
    pool: PgPool,
}

impl PostgresClusterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(pool: &PgPool) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_nodes (
                id INTEGER PRIMARY KEY,
                hostname TEXT NOT NULL,
                node_groups TEXT NOT NULL DEFAULT '',
                last_heartbeat TIMESTAMPTZ NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn row_to_node(row: &sqlx::postgres::PgRow) -> EngineResult<ClusterNodeInfo> {
        let groups_column: String = row.try_get("node_groups")?;
        Ok(ClusterNodeInfo {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            groups: ClusterNodeInfo::parse_groups(&groups_column),
            last_heartbeat: row.try_get("last_heartbeat")?,
            active: row.try_get("active")?,
            registered_at: row.try_get("registered_at")?,
        })
    }
}

#[async_trait]
impl ClusterRepository for PostgresClusterRepository {
    async fn register(&self, node: &ClusterNodeInfo) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_nodes (id, hostname, node_groups, last_heartbeat, active, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                node_groups = EXCLUDED.node_groups,
                last_heartbeat = EXCLUDED.last_heartbeat,
                active = EXCLUDED.active
            "#,
        )
        .bind(node.id)
        .bind(&node.hostname)
        .bind(node.groups_column())
        .bind(node.last_heartbeat)
        .bind(node.active)
        .bind(node.registered_at)
        .execute(&self.pool)
        .await?;

        debug!("注册集群节点: {} ({})", node.id, node.hostname);
        Ok(())
    }

    async fn heartbeat(&self, node_id: i32, at: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE cluster_nodes SET last_heartbeat = $2, active = TRUE WHERE id = $1")
            .bind(node_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_node(&self, node_id: i32) -> EngineResult<Option<ClusterNodeInfo>> {
        let row = sqlx::query(
            "SELECT id, hostname, node_groups, last_heartbeat, active, registered_at \
             FROM cluster_nodes WHERE id = $1",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn list_nodes(&self) -> EngineResult<Vec<ClusterNodeInfo>> {
        let rows = sqlx::query(
            "SELECT id, hostname, node_groups, last_heartbeat, active, registered_at \
             FROM cluster_nodes ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_node).collect()
    }

    fn default_stale_timeout(&self) -> Duration {
        DEFAULT_STALE_TIMEOUT
    }
}
