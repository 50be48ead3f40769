//! Agent控制通道
//!
//! 传输层只负责帧的收发, 协议状态机在 [`session`] 中实现, 与axum无关,
//! 测试可以直接用内存通道驱动会话。

pub mod frame;
pub mod rate_limiter;
pub mod registry;
pub mod session;

pub use frame::{CloseReason, Frame, TransportError};
pub use rate_limiter::SlidingWindowLimiter;
pub use registry::{Attachment, ConnectionRegistry};
pub use session::{run_session, ChannelContext, SessionEnd};
