/// Reserved target meaning "every connected Pilot".
pub const BROADCAST_ADDRESS: &str = "X";

/// Reserved target for notifications addressed to the Terminal's observer.
pub const TERMINAL_ADDRESS: &str = "T";

/// Maximum number of string-encoded layers `decode` will unwrap.
pub const MAX_DECODE_DEPTH: usize = 4;

/// Delay before an unacknowledged command is re-sent.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 10_000;

/// Re-send attempts granted to a command after its first expiry.
pub const DEFAULT_RETRY_BUDGET: i64 = 5;

/// Broadcast PING rounds during discovery.
pub const DEFAULT_BROADCAST_ROUNDS: u32 = 5;
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 1_000;

/// Directed PING rounds for workers still missing after the broadcast phase.
pub const DEFAULT_DIRECTED_ROUNDS: u32 = 5;
pub const DEFAULT_DIRECTED_INTERVAL_MS: u64 = 2_000;
