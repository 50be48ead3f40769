use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use fleet_control::{install_metrics_exporter, wait_for_shutdown_signal, Application, ShutdownManager};
use fleet_core::config::{AppConfig, LogFormat};
use fleet_core::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("fleet-control")
        .version(env!("CARGO_PKG_VERSION"))
        .about("桌面Agent集群控制平面")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径, 也可通过 FLEET_CONFIG 指定; 都未指定时依次尝试 config/fleet.toml 等默认路径"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("覆盖配置中的监听地址"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .or_else(|| std::env::var("FLEET_CONFIG").ok());

    // 加载配置, 命令行参数优先
    let mut config = AppConfig::load(config_path.as_deref()).context("加载配置失败")?;
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.server.bind_address = bind.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.parse::<LogFormat>()?;
    }

    init_logging(&config.logging)?;

    info!("启动桌面Agent集群控制平面");
    if let Some(path) = &config_path {
        info!("配置文件: {path}");
    }

    let mut app = Application::new(config.clone()).await?;
    if config.server.metrics_enabled {
        app = app.with_prometheus(install_metrics_exporter()?);
    }

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("绑定地址失败: {}", config.server.bind_address))?;

    // 创建优雅关闭管理器
    let shutdown_manager = ShutdownManager::new();
    let shutdown_rx = shutdown_manager.subscribe();
    let mut app_handle = tokio::spawn(async move { app.run(listener, shutdown_rx).await });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            // 服务提前退出, 不再等待信号
            match result {
                Ok(Ok(())) => info!("应用已退出"),
                Ok(Err(e)) => error!("应用运行失败: {e:#}"),
                Err(e) => error!("应用任务异常: {e}"),
            }
            return Ok(());
        }
    }

    shutdown_manager.shutdown();

    // 等待应用关闭，设置超时
    let grace = Duration::from_secs(config.server.shutdown_timeout_seconds);
    match tokio::time::timeout(grace, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("应用任务异常: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("控制平面已退出");
    Ok(())
}
