use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits;

/// HTTP服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
    pub metrics_enabled: bool,
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
            cors_origins: vec!["*".to_string()],
            metrics_enabled: true,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("绑定地址不能为空"));
        }
        if self.shutdown_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("关闭超时时间必须大于0"));
        }
        Ok(())
    }
}

/// 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            url: "sqlite://fleet.db".to_string(),
            max_connections: 10,
            connection_timeout_seconds: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == StorageBackend::Memory {
            return Ok(());
        }
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }
        if !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("数据库URL必须是SQLite格式"));
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        Ok(())
    }
}

/// 控制通道配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub auth_timeout_seconds: u64,
    pub rate_limit_per_second: u32,
    pub rate_limit_window_ms: u64,
    pub max_message_bytes: usize,
    pub max_violations: u32,
    /// 每个连接的待发送消息缓冲
    pub outbound_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: limits::HEARTBEAT_INTERVAL_SECONDS, // 30秒心跳
            heartbeat_timeout_seconds: limits::HEARTBEAT_TIMEOUT_SECONDS,   // 90秒超时
            auth_timeout_seconds: limits::AUTH_TIMEOUT_SECONDS,
            rate_limit_per_second: limits::RATE_LIMIT_MESSAGES_PER_SECOND,
            rate_limit_window_ms: limits::RATE_LIMIT_WINDOW_MS,
            max_message_bytes: limits::MAX_MESSAGE_BYTES,
            max_violations: limits::MAX_VALIDATION_VIOLATIONS,
            outbound_buffer: 64,
        }
    }
}

impl ChannelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_seconds)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.heartbeat_timeout_seconds <= self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!(
                "心跳超时({}秒)必须大于心跳间隔({}秒)",
                self.heartbeat_timeout_seconds,
                self.heartbeat_interval_seconds
            ));
        }
        if self.auth_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("认证窗口必须大于0"));
        }
        if self.rate_limit_per_second == 0 || self.rate_limit_window_ms == 0 {
            return Err(anyhow::anyhow!("速率限制必须大于0"));
        }
        if self.max_message_bytes == 0 {
            return Err(anyhow::anyhow!("消息大小上限必须大于0"));
        }
        if self.max_violations == 0 {
            return Err(anyhow::anyhow!("违规次数上限必须大于0"));
        }
        if self.outbound_buffer == 0 {
            return Err(anyhow::anyhow!("发送缓冲必须大于0"));
        }
        Ok(())
    }
}

/// 任务编排配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub dispatch_interval_ms: u64,
    pub dispatch_timeout_seconds: u64,
    pub default_max_retries: u32,
    pub max_retries_limit: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_seconds: u64,
    pub default_priority: i32,
    pub min_priority: i32,
    pub max_priority: i32,
    pub default_max_load: i32,
    /// 保留的已结束任务数量
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: limits::DISPATCH_INTERVAL_MS,
            dispatch_timeout_seconds: limits::DISPATCH_TIMEOUT_SECONDS, // 5分钟
            default_max_retries: limits::DEFAULT_MAX_RETRIES,
            max_retries_limit: limits::MAX_RETRIES_LIMIT,
            retry_base_delay_ms: limits::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: limits::RETRY_MAX_DELAY_MS,
            breaker_failure_threshold: limits::CIRCUIT_FAILURE_THRESHOLD,
            breaker_cooldown_seconds: limits::CIRCUIT_COOLDOWN_SECONDS,
            default_priority: limits::DEFAULT_PRIORITY,
            min_priority: limits::MIN_PRIORITY,
            max_priority: limits::MAX_PRIORITY,
            default_max_load: limits::DEFAULT_MAX_LOAD,
            history_limit: 1000,
        }
    }
}

impl OrchestratorConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_seconds)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_interval_ms == 0 {
            return Err(anyhow::anyhow!("派发间隔必须大于0"));
        }
        if self.dispatch_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("派发超时必须大于0"));
        }
        if self.default_max_retries > self.max_retries_limit {
            return Err(anyhow::anyhow!(
                "默认重试次数({})不能超过上限({})",
                self.default_max_retries,
                self.max_retries_limit
            ));
        }
        if self.retry_base_delay_ms == 0 || self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(anyhow::anyhow!("重试延迟配置无效"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(anyhow::anyhow!("熔断阈值必须大于0"));
        }
        if self.min_priority > self.max_priority
            || !(self.min_priority..=self.max_priority).contains(&self.default_priority)
        {
            return Err(anyhow::anyhow!("优先级范围配置无效"));
        }
        if self.default_max_load <= 0 {
            return Err(anyhow::anyhow!("Agent默认并发数必须大于0"));
        }
        Ok(())
    }
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: limits::SCHEDULER_TICK_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度器检查间隔必须大于0"));
        }
        Ok(())
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(anyhow::anyhow!("不支持的日志格式: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.level,
                valid_levels
            ));
        }
        Ok(())
    }
}
