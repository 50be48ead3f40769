use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use fleet_agent::{AgentConfig, AgentRunner};
use fleet_core::config::{LogFormat, LoggingConfig};
use fleet_core::logging::init_logging;

#[derive(Parser)]
#[command(name = "fleet-agent")]
#[command(about = "桌面Agent, 连接到控制平面并执行命令")]
#[command(version)]
struct Cli {
    /// 控制平面地址
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// 设备ID, 默认使用主机名
    #[arg(long)]
    device_id: Option<String>,

    /// 所有者ID
    #[arg(long)]
    owner: String,

    /// 额外声明的能力, 可重复
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// 最大并发命令数
    #[arg(long)]
    max_concurrent: Option<i32>,

    /// 禁用shell命令
    #[arg(long)]
    disable_shell: bool,

    /// 重连间隔上限(秒)
    #[arg(long, default_value = "60")]
    reconnect_max_seconds: u64,

    /// 日志级别
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 日志格式 (json, pretty)
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
    })?;

    let defaults = AgentConfig::default();
    let config = AgentConfig {
        server_url: cli.server,
        device_id: cli.device_id.unwrap_or(defaults.device_id.clone()),
        owner_id: cli.owner,
        capabilities: cli.capabilities,
        max_concurrent_commands: cli.max_concurrent,
        shell_enabled: !cli.disable_shell,
        reconnect_max: Duration::from_secs(cli.reconnect_max_seconds),
        ..defaults
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到Ctrl+C, 正在关闭");
            let _ = shutdown_tx.send(true);
        }
    });

    AgentRunner::new(config)
        .run(shutdown_rx)
        .await
        .context("Agent运行失败")
}
