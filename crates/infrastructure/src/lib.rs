pub mod database;
pub mod memory;
pub mod metrics;

pub use database::sqlite::{
    SqliteAgentLogRepository, SqliteAgentRepository, SqliteCommandRepository,
    SqliteScheduleRepository,
};
pub use database::DatabaseManager;
pub use memory::{
    InMemoryAgentLogRepository, InMemoryAgentRepository, InMemoryCommandRepository,
    InMemoryScheduleRepository,
};
pub use metrics::MetricsCollector;
