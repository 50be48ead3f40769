//! 命令执行器
//!
//! 每种命令类型对应一个 [`CommandExecutor`], 由 [`ExecutorRegistry`] 按类型分派。
//! 执行结果是任意JSON, 失败时返回带错误码的 [`ExecutionError`]。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ExecutionError;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    fn command_type(&self) -> &'static str;

    async fn execute(&self, parameters: &Value) -> Result<Value, ExecutionError>;
}

/// 原样返回参数, 用于连通性检查
pub struct EchoExecutor;

#[async_trait]
impl CommandExecutor for EchoExecutor {
    fn command_type(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, parameters: &Value) -> Result<Value, ExecutionError> {
        Ok(parameters.clone())
    }
}

/// 上报主机信息
pub struct SystemInfoExecutor;

#[async_trait]
impl CommandExecutor for SystemInfoExecutor {
    fn command_type(&self) -> &'static str {
        "system_info"
    }

    async fn execute(&self, _parameters: &Value) -> Result<Value, ExecutionError> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(json!({
            "hostname": hostname,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cpus": cpus,
            "agent_version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

/// Shell命令参数
#[derive(Debug, Clone, Deserialize)]
pub struct ShellParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub timeout_seconds: Option<u64>,
}

/// 执行本地进程, 非零退出码视为失败
pub struct ShellExecutor {
    default_timeout: Duration,
}

impl ShellExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    fn command_type(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, parameters: &Value) -> Result<Value, ExecutionError> {
        let params: ShellParams = serde_json::from_value(parameters.clone())
            .map_err(|e| ExecutionError::invalid_params(format!("解析Shell参数失败: {e}")))?;
        if params.command.trim().is_empty() {
            return Err(ExecutionError::invalid_params("命令不能为空"));
        }
        let timeout = params
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        info!("执行Shell命令: command={}, args={:?}", params.command, params.args);
        let start = Instant::now();

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .envs(&params.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecutionError::failed(format!("启动Shell命令失败: {e}")))?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                output.map_err(|e| ExecutionError::failed(format!("等待进程结束失败: {e}")))?
            }
            Err(_) => {
                return Err(ExecutionError::new(
                    "TIMEOUT",
                    format!("命令在{}秒内未结束", timeout.as_secs()),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Shell命令结束: exit_code={:?}, duration={}ms",
            output.status.code(),
            duration_ms
        );

        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!("命令执行失败，退出码: {:?}", output.status.code())
            } else {
                stderr
            };
            return Err(ExecutionError::failed(message));
        }

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
            "duration_ms": duration_ms,
        }))
    }
}

/// 按命令类型查找执行器
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn CommandExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置执行器; 可以关闭shell
    pub fn with_defaults(shell_enabled: bool) -> Self {
        let mut registry = Self::new()
            .with(Arc::new(EchoExecutor))
            .with(Arc::new(SystemInfoExecutor));
        if shell_enabled {
            registry = registry.with(Arc::new(ShellExecutor::default()));
        }
        registry
    }

    pub fn with(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executors.insert(executor.command_type(), executor);
        self
    }

    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().map(|t| t.to_string()).collect();
        types.sort();
        types
    }

    pub async fn execute(&self, command_type: &str, parameters: &Value) -> Result<Value, ExecutionError> {
        match self.executors.get(command_type) {
            Some(executor) => executor.execute(parameters).await,
            None => Err(ExecutionError::unsupported(command_type)),
        }
    }
}
