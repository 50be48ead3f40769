pub mod agent_repository;
pub mod command_repository;
pub mod log_repository;
pub mod schedule_repository;

pub use agent_repository::SqliteAgentRepository;
pub use command_repository::SqliteCommandRepository;
pub use log_repository::SqliteAgentLogRepository;
pub use schedule_repository::SqliteScheduleRepository;
