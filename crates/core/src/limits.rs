//! 协议契约中的运行限制, 作为各配置项的默认值

/// 每个连接每个滑动窗口内允许的消息数
pub const RATE_LIMIT_MESSAGES_PER_SECOND: u32 = 20;
pub const RATE_LIMIT_WINDOW_MS: u64 = 1_000;
/// 单条应用消息的字节上限(1 MiB)
pub const MAX_MESSAGE_BYTES: usize = 1_048_576;
pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
pub const HEARTBEAT_TIMEOUT_SECONDS: u64 = 90;
/// 连接升级后必须在此窗口内完成认证
pub const AUTH_TIMEOUT_SECONDS: u64 = 10;
pub const MAX_VALIDATION_VIOLATIONS: u32 = 5;

pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;
pub const CIRCUIT_COOLDOWN_SECONDS: u64 = 60;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_RETRIES_LIMIT: u32 = 10;
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

pub const DISPATCH_TIMEOUT_SECONDS: u64 = 300;
pub const DISPATCH_INTERVAL_MS: u64 = 1_000;
pub const SCHEDULER_TICK_MS: u64 = 1_000;

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_LOAD: i32 = 5;

/// WebSocket关闭码
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;
    pub const AUTH_FAILED: u16 = 4001;
    pub const SUPERSEDED: u16 = 4009;
    pub const RATE_LIMITED: u16 = 4029;
}
