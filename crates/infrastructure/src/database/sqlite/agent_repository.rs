use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::models::{Agent, AgentStatus, DeviceMetadata, SlotRelease};
use fleet_core::traits::AgentRepository;
use fleet_core::FleetResult;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

const AGENT_COLUMNS: &str = "id, device_id, owner_id, token, capabilities, platform, version, hostname, status, \
     last_heartbeat, last_address, current_load, max_load, completed_count, failed_count, \
     avg_response_ms, revoked, deleted_at, created_at, updated_at";

pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> FleetResult<Agent> {
        Ok(Agent {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            owner_id: row.try_get("owner_id")?,
            token: row.try_get("token")?,
            capabilities: MappingHelpers::parse_json(row, "capabilities")?,
            metadata: DeviceMetadata {
                platform: row.try_get("platform")?,
                version: row.try_get("version")?,
                hostname: row.try_get("hostname")?,
            },
            status: MappingHelpers::parse_enum(row, "status")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            last_address: row.try_get("last_address")?,
            current_load: row.try_get("current_load")?,
            max_load: row.try_get("max_load")?,
            completed_count: row.try_get("completed_count")?,
            failed_count: row.try_get("failed_count")?,
            avg_response_ms: row.try_get("avg_response_ms")?,
            revoked: row.try_get("revoked")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_one_where(&self, clause: &str, value: &str) -> FleetResult<Option<Agent>> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE {clause}"))
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn insert(&self, agent: &Agent) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, device_id, owner_id, token, capabilities, platform, version, hostname,
                status, last_heartbeat, last_address, current_load, max_load, completed_count, failed_count,
                avg_response_ms, revoked, deleted_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.device_id)
        .bind(&agent.owner_id)
        .bind(&agent.token)
        .bind(MappingHelpers::to_json(&agent.capabilities)?)
        .bind(&agent.metadata.platform)
        .bind(&agent.metadata.version)
        .bind(&agent.metadata.hostname)
        .bind(agent.status.as_str())
        .bind(agent.last_heartbeat)
        .bind(&agent.last_address)
        .bind(agent.current_load)
        .bind(agent.max_load)
        .bind(agent.completed_count)
        .bind(agent.failed_count)
        .bind(agent.avg_response_ms)
        .bind(agent.revoked)
        .bind(agent.deleted_at)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("注册Agent成功: {}", agent.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Agent>> {
        self.fetch_one_where("id = ?", id).await
    }

    async fn find_by_token(&self, token: &str) -> FleetResult<Option<Agent>> {
        self.fetch_one_where("token = ?", token).await
    }

    async fn find_active_by_device(&self, device_id: &str) -> FleetResult<Option<Agent>> {
        self.fetch_one_where("device_id = ? AND deleted_at IS NULL", device_id)
            .await
    }

    async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Agent>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE deleted_at IS NULL AND owner_id = ? ORDER BY created_at, id"
                ))
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE deleted_at IS NULL ORDER BY created_at, id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn update_profile(&self, agent: &Agent) -> FleetResult<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET capabilities = ?, platform = ?, version = ?, hostname = ?, max_load = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(MappingHelpers::to_json(&agent.capabilities)?)
        .bind(&agent.metadata.platform)
        .bind(&agent.metadata.version)
        .bind(&agent.metadata.hostname)
        .bind(agent.max_load)
        .bind(Utc::now())
        .bind(&agent.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        from: AgentStatus,
        to: AgentStatus,
    ) -> FleetResult<bool> {
        let result =
            sqlx::query("UPDATE agents SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(Utc::now())
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        address: Option<&str>,
    ) -> FleetResult<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET last_heartbeat = ?, last_address = COALESCE(?, last_address), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(address)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_slot(&self, id: &str) -> FleetResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE agents
            SET current_load = current_load + 1,
                status = CASE WHEN current_load + 1 >= max_load THEN 'busy' ELSE status END,
                updated_at = ?
            WHERE id = ? AND status = 'online' AND current_load < max_load
                AND revoked = 0 AND deleted_at IS NULL
            RETURNING {AGENT_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn release_slot(&self, id: &str, release: SlotRelease) -> FleetResult<Option<Agent>> {
        let (completed, failed, response_ms) = match release {
            SlotRelease::Completed { response_ms } => (1_i64, 0_i64, response_ms),
            SlotRelease::Failed => (0, 1, 0.0),
        };

        // SET子句中的列引用都取更新前的值
        let row = sqlx::query(&format!(
            r#"
            UPDATE agents
            SET current_load = MAX(current_load - 1, 0),
                status = CASE WHEN status = 'busy' THEN 'online' ELSE status END,
                completed_count = completed_count + ?,
                failed_count = failed_count + ?,
                avg_response_ms = CASE WHEN ? = 1
                    THEN avg_response_ms + (? - avg_response_ms) / (completed_count + 1)
                    ELSE avg_response_ms END,
                updated_at = ?
            WHERE id = ?
            RETURNING {AGENT_COLUMNS}
            "#
        ))
        .bind(completed)
        .bind(failed)
        .bind(completed)
        .bind(response_ms)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(
            "UPDATE agents SET revoked = 1, deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_liveness(&self) -> FleetResult<u64> {
        let result = sqlx::query(
            "UPDATE agents SET status = 'offline', current_load = 0, updated_at = ? WHERE status != 'offline' OR current_load != 0",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
