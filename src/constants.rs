// -
// Namespace

/// Root of the hierarchical namespace; always exists
pub const ROOT_PATH: &str = "/";

/// Path segment separator
pub const PATH_SEPARATOR: char = '/';

/// Width of the counter appended to sequential node names
pub(crate) const SEQUENTIAL_SUFFIX_WIDTH: usize = 10;

// -
// Wire

/// Upper bound for a single length-delimited frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Replies kept per session to answer resent requests after a reconnect
pub(crate) const REPLY_CACHE_CAPACITY: usize = 1024;

/// Events parked per disconnected session before the oldest are dropped
pub(crate) const PARKED_EVENT_CAPACITY: usize = 4096;

// -
// Session

/// Heartbeats are sent every `session_timeout / HEARTBEAT_DIVISOR`
pub(crate) const HEARTBEAT_DIVISOR: u32 = 3;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DCOORD";

/// Buffer of the client-level background listener channel
pub(crate) const BACKGROUND_EVENT_CAPACITY: usize = 256;

/// Buffer of the session state-change broadcast channel
pub(crate) const STATE_CHANGE_CAPACITY: usize = 64;
