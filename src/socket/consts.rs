// src/socket/consts.rs

/// WebSocket close code the server uses when it rejects the bearer credential
/// on an established connection.
pub const AUTH_REJECTED_CLOSE_CODE: u16 = 4001;

/// Upper bound for a single outbound text frame.
pub const FRAME_MAX_SIZE: usize = 1 << 20;

/// Capacity of the per-connection event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;
