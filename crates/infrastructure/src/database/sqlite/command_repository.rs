use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::models::{Command, CommandStatus};
use fleet_core::traits::CommandRepository;
use fleet_core::FleetResult;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

const COMMAND_COLUMNS: &str = "id, agent_id, issuer_id, command_type, parameters, status, result, error_code, \
     error_message, created_at, sent_at, started_at, completed_at, execution_ms, updated_at";

pub struct SqliteCommandRepository {
    pool: SqlitePool,
}

impl SqliteCommandRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_command(row: &sqlx::sqlite::SqliteRow) -> FleetResult<Command> {
        Ok(Command {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            issuer_id: row.try_get("issuer_id")?,
            command_type: row.try_get("command_type")?,
            parameters: MappingHelpers::parse_json(row, "parameters")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            result: MappingHelpers::parse_optional_json(row, "result")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            execution_ms: row.try_get("execution_ms")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// 读取当前行, 若可转到目标状态则以读到的状态为条件写入终态
    async fn finish(
        &self,
        id: &str,
        target: CommandStatus,
        result: Option<&Value>,
        error: Option<(&str, &str)>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let Some(current) = self.get(id).await? else {
            return Ok(false);
        };
        if !current.status.can_transition_to(target) {
            debug!(
                "忽略命令{}的终态更新: {} -> {}",
                id, current.status, target
            );
            return Ok(false);
        }

        let result_json = result.map(MappingHelpers::to_json).transpose()?;
        let (error_code, error_message) = error.unzip();
        let outcome = sqlx::query(
            r#"
            UPDATE commands
            SET status = ?, result = ?, error_code = ?, error_message = ?,
                completed_at = ?, execution_ms = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(target.as_str())
        .bind(result_json)
        .bind(error_code)
        .bind(error_message)
        .bind(at)
        .bind(current.measure_execution(at))
        .bind(at)
        .bind(id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }
}

#[async_trait]
impl CommandRepository for SqliteCommandRepository {
    async fn insert(&self, command: &Command) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO commands (id, agent_id, issuer_id, command_type, parameters, status, result,
                error_code, error_message, created_at, sent_at, started_at, completed_at, execution_ms, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&command.id)
        .bind(&command.agent_id)
        .bind(&command.issuer_id)
        .bind(&command.command_type)
        .bind(MappingHelpers::to_json(&command.parameters)?)
        .bind(command.status.as_str())
        .bind(command.result.as_ref().map(MappingHelpers::to_json).transpose()?)
        .bind(&command.error_code)
        .bind(&command.error_message)
        .bind(command.created_at)
        .bind(command.sent_at)
        .bind(command.started_at)
        .bind(command.completed_at)
        .bind(command.execution_ms)
        .bind(command.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("创建命令成功: {}", command.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Command>> {
        let row = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_command).transpose()
    }

    async fn list_by_agent(&self, agent_id: &str, limit: i64) -> FleetResult<Vec<Command>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE agent_id = ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_command).collect()
    }

    async fn list_by_status(&self, statuses: &[CommandStatus]) -> FleetResult<Vec<Command>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE status IN ({placeholders}) ORDER BY created_at"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_command).collect()
    }

    async fn mark_sent(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(
            "UPDATE commands SET status = 'sent', sent_at = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_executing(&self, id: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(
            "UPDATE commands SET status = 'executing', started_at = ?, updated_at = ? WHERE id = ? AND status = 'sent'",
        )
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: &str, result: &Value, at: DateTime<Utc>) -> FleetResult<bool> {
        self.finish(id, CommandStatus::Completed, Some(result), None, at)
            .await
    }

    async fn fail(
        &self,
        id: &str,
        code: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        self.finish(id, CommandStatus::Failed, None, Some((code, message)), at)
            .await
    }
}
