//! # Fleet Agent
//!
//! 桌面Agent参考实现: 通过REST注册, 通过控制通道接收命令并回报结果。

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod executors;
pub mod runner;

pub use channel::{authenticate, AuthenticatedChannel, SessionOutcome};
pub use client::ControlPlaneClient;
pub use config::{AgentConfig, ReconnectBackoff};
pub use error::{AgentError, AgentResult, ExecutionError};
pub use executors::{CommandExecutor, EchoExecutor, ExecutorRegistry, ShellExecutor, SystemInfoExecutor};
pub use runner::AgentRunner;
