pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

pub const COMPILE_TX_ERR: &str = "Failed to send run to compiling stage";
pub const RUN_TX_ERR: &str = "Failed to send run to running stage";
pub const STATE_TX_ERR: &str = "Failed to send run state, receiver is gone";
pub const STREAM_TX_ERR: &str = "Failed to send run snapshot to stream";

/// Forbidden constructs for hand-written sorting exercises.
pub const SORT_CALLS: &[&str] = &[".sort("];
/// Forbidden constructs for the legacy numbered exercises.
pub const SORT_AND_EXTREMA_CALLS: &[&str] = &[".sort(", "Math.max(", "Math.min("];
