pub mod mapping;
pub mod sqlite;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_core::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// SQLite连接池及表结构初始化
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("创建SQLite数据库连接池: {}", config.url);

        let in_memory = config.url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&config.url)
            .context("解析数据库URL失败")?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存数据库每个连接都是独立的库, 只能使用单连接并保持常驻
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await
            .context("创建数据库连接池失败")?;

        let manager = Self { pool };
        manager.migrate().await.context("运行数据库迁移失败")?;
        Ok(manager)
    }

    /// 测试和嵌入场景使用的内存数据库
    pub async fn in_memory() -> Result<Self> {
        Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("运行SQLite数据库迁移");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                token TEXT NOT NULL UNIQUE,
                capabilities TEXT NOT NULL DEFAULT '[]',
                platform TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL DEFAULT '',
                hostname TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'offline',
                last_heartbeat DATETIME,
                last_address TEXT,
                current_load INTEGER NOT NULL DEFAULT 0,
                max_load INTEGER NOT NULL DEFAULT 5,
                completed_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                avg_response_ms REAL NOT NULL DEFAULT 0,
                revoked BOOLEAN NOT NULL DEFAULT 0,
                deleted_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建Agent表失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commands (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                issuer_id TEXT NOT NULL,
                command_type TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT 'null',
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error_code TEXT,
                error_message TEXT,
                created_at DATETIME NOT NULL,
                sent_at DATETIME,
                started_at DATETIME,
                completed_at DATETIME,
                execution_ms INTEGER,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建命令表失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                name TEXT NOT NULL,
                command_type TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT 'null',
                schedule_type TEXT NOT NULL,
                schedule_config TEXT NOT NULL,
                next_run_at DATETIME,
                last_run_at DATETIME,
                run_count INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                status TEXT NOT NULL DEFAULT 'active',
                last_error TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建调度表失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建Agent日志表失败")?;

        let indexes = [
            (
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_active_device ON agents(device_id) WHERE deleted_at IS NULL",
                "创建Agent设备索引失败",
            ),
            (
                "CREATE INDEX IF NOT EXISTS idx_agents_owner ON agents(owner_id)",
                "创建Agent所有者索引失败",
            ),
            (
                "CREATE INDEX IF NOT EXISTS idx_commands_agent ON commands(agent_id)",
                "创建命令Agent索引失败",
            ),
            (
                "CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status)",
                "创建命令状态索引失败",
            ),
            (
                "CREATE INDEX IF NOT EXISTS idx_schedules_status ON schedules(status)",
                "创建调度状态索引失败",
            ),
            (
                "CREATE INDEX IF NOT EXISTS idx_agent_logs_agent ON agent_logs(agent_id)",
                "创建日志Agent索引失败",
            ),
        ];
        for (statement, context) in indexes {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context(context)?;
        }

        info!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
