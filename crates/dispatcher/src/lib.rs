//! Fleet dispatcher
//!
//! Agent directory, command lifecycle, task orchestration and scheduling.
//! The control channel sits on top of this crate and reaches it through the
//! `CommandSender` / `CommandOutcomeHandler` seams defined in `fleet-core`.

pub mod breakers;
pub mod commands;
pub mod cron_utils;
pub mod directory;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod strategies;

pub use breakers::CircuitBreakerRegistry;
pub use commands::CommandLifecycle;
pub use directory::AgentDirectory;
pub use orchestrator::{OrchestratorStats, RecoveryReport, TaskOrchestrator};
pub use retry::RetryPolicy;
pub use scheduler::{FireReport, Scheduler};
pub use strategies::{AgentSelectionStrategy, LeastLoadedStrategy};
