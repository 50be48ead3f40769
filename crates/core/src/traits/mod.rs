pub mod channel;
pub mod repository;

pub use channel::*;
pub use repository::*;
