// Fundamental configuration constants
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4040;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_CLIENT_IO_TIMEOUT_SECS: u64 = 5;

/// Pending-connection hint passed to `listen(2)`
pub const LISTEN_BACKLOG: i32 = 20;

/// Extra multiplexor slots for the listening socket and the stop channel
pub const RESERVED_MPLEX_SLOTS: usize = 2;

// Wire protocol limits
pub const MSG_DATA_MAX_SIZE: usize = 400;
pub const MAX_TARGET_LEN: usize = 255;

// Event loop tuning
pub const MAX_CONSECUTIVE_WAIT_FAILURES: u32 = 8;

/// Bytes taken from a client socket per readiness event
pub const READ_CHUNK_SIZE: usize = 4096;
