use async_trait::async_trait;
use chrono::Utc;
use fleet_core::models::{AgentLog, NewAgentLog};
use fleet_core::traits::AgentLogRepository;
use fleet_core::FleetResult;
use sqlx::{Row, SqlitePool};

use crate::database::mapping::MappingHelpers;

pub struct SqliteAgentLogRepository {
    pool: SqlitePool,
}

impl SqliteAgentLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentLogRepository for SqliteAgentLogRepository {
    async fn insert(&self, log: &NewAgentLog) -> FleetResult<i64> {
        let metadata = log.metadata.as_ref().map(MappingHelpers::to_json).transpose()?;
        let result = sqlx::query(
            "INSERT INTO agent_logs (agent_id, level, message, metadata, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&log.agent_id)
        .bind(&log.level)
        .bind(&log.message)
        .bind(metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_by_agent(&self, agent_id: &str, limit: i64) -> FleetResult<Vec<AgentLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, agent_id, level, message, metadata, created_at
            FROM agent_logs WHERE agent_id = ? ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> FleetResult<AgentLog> {
                Ok(AgentLog {
                    id: row.try_get("id")?,
                    agent_id: row.try_get("agent_id")?,
                    level: row.try_get("level")?,
                    message: row.try_get("message")?,
                    metadata: MappingHelpers::parse_optional_json(row, "metadata")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
