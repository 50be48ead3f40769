pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod limits;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod shutdown;
pub mod traits;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use config::AppConfig;
pub use errors::{AuthError, FleetError, FleetResult};
pub use protocol::{ChannelMessage, Envelope};
