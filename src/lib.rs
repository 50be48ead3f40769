//! # Fleet Control
//!
//! 桌面Agent集群控制平面的进程装配: 存储选择、启动恢复、后台循环和HTTP服务。

pub mod app;
pub mod shutdown;

pub use app::{install_metrics_exporter, Application};
pub use shutdown::{wait_for_shutdown_signal, ShutdownManager};
