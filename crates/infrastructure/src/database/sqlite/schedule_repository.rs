use async_trait::async_trait;
use chrono::Utc;
use fleet_core::models::{Schedule, ScheduleStatus};
use fleet_core::traits::ScheduleRepository;
use fleet_core::{FleetError, FleetResult};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

const SCHEDULE_COLUMNS: &str = "id, owner_id, agent_id, name, command_type, parameters, schedule_type, \
     schedule_config, next_run_at, last_run_at, run_count, retry_count, max_retries, status, last_error, \
     created_at, updated_at";

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &sqlx::sqlite::SqliteRow) -> FleetResult<Schedule> {
        let retry_count: i64 = row.try_get("retry_count")?;
        let max_retries: i64 = row.try_get("max_retries")?;
        Ok(Schedule {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            agent_id: row.try_get("agent_id")?,
            name: row.try_get("name")?,
            command_type: row.try_get("command_type")?,
            parameters: MappingHelpers::parse_json(row, "parameters")?,
            kind: MappingHelpers::parse_json(row, "schedule_config")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            run_count: row.try_get("run_count")?,
            retry_count: retry_count.try_into().unwrap_or(0),
            max_retries: max_retries.try_into().unwrap_or(0),
            status: MappingHelpers::parse_enum(row, "status")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    async fn insert(&self, schedule: &Schedule) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, owner_id, agent_id, name, command_type, parameters, schedule_type,
                schedule_config, next_run_at, last_run_at, run_count, retry_count, max_retries, status,
                last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.owner_id)
        .bind(&schedule.agent_id)
        .bind(&schedule.name)
        .bind(&schedule.command_type)
        .bind(MappingHelpers::to_json(&schedule.parameters)?)
        .bind(schedule.kind.type_name())
        .bind(MappingHelpers::to_json(&schedule.kind)?)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.run_count)
        .bind(i64::from(schedule.retry_count))
        .bind(i64::from(schedule.max_retries))
        .bind(schedule.status.as_str())
        .bind(&schedule.last_error)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("创建调度成功: {}", schedule.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Schedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_schedule).transpose()
    }

    async fn list(&self, owner_id: Option<&str>) -> FleetResult<Vec<Schedule>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE owner_id = ? ORDER BY created_at, id"
                ))
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at, id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn list_by_status(&self, status: ScheduleStatus) -> FleetResult<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE status = ? ORDER BY created_at, id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn update(&self, schedule: &Schedule) -> FleetResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET name = ?, command_type = ?, parameters = ?, schedule_type = ?, schedule_config = ?,
                next_run_at = ?, last_run_at = ?, run_count = ?, retry_count = ?, max_retries = ?,
                status = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&schedule.name)
        .bind(&schedule.command_type)
        .bind(MappingHelpers::to_json(&schedule.parameters)?)
        .bind(schedule.kind.type_name())
        .bind(MappingHelpers::to_json(&schedule.kind)?)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.run_count)
        .bind(i64::from(schedule.retry_count))
        .bind(i64::from(schedule.max_retries))
        .bind(schedule.status.as_str())
        .bind(&schedule.last_error)
        .bind(Utc::now())
        .bind(&schedule.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::ScheduleNotFound {
                id: schedule.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> FleetResult<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
