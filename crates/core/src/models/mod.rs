pub mod agent;
pub mod command;
pub mod log;
pub mod schedule;
pub mod task;

pub use agent::*;
pub use command::*;
pub use log::*;
pub use schedule::*;
pub use task::*;
