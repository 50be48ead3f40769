pub mod agents;
pub mod channel;
pub mod commands;
pub mod events;
pub mod health;
pub mod metrics;
pub mod schedules;
pub mod tasks;
