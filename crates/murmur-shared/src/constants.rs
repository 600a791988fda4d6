/// Application name
pub const APP_NAME: &str = "Murmur";

/// Hard ceiling on message body length, in characters
pub const MAX_BODY_LEN: usize = 5000;

/// Number of most recent messages a timeline subscription carries
pub const DEFAULT_TIMELINE_LIMIT: usize = 150;

/// Optimistic echoes allowed in flight before sends are refused
pub const DEFAULT_PENDING_LIMIT: usize = 20;

/// Echoes unmatched after this long are marked failed
pub const DEFAULT_ECHO_TIMEOUT_MS: u64 = 8_000;

/// Store calls still outstanding after this long are abandoned
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 15_000;

/// How often the synchronizer sweeps for timed-out echoes
pub const DEFAULT_ECHO_SWEEP_MS: u64 = 500;

/// Quiet period after the last keystroke before "stopped typing" is published
pub const DEFAULT_TYPING_DEBOUNCE_MS: u64 = 2_000;

/// Remote typing records older than this are ignored
pub const DEFAULT_TYPING_STALE_MS: u64 = 10_000;

/// Sliding-window send throttle: at most this many sends...
pub const DEFAULT_RATE_MAX_SENDS: usize = 10;

/// ...per this many seconds
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 10;

/// Size of the "pinned messages" list
pub const DEFAULT_PINNED_CAP: usize = 10;

/// Resubscribe backoff bounds
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Length of the quoted snippet stored with a reply
pub const REPLY_SNIPPET_CHARS: usize = 100;

/// Prefix of client-local temporary message ids
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Joins the two participant ids of a direct conversation
pub const DIRECT_ID_SEPARATOR: char = ':';

/// Presence bus topic prefix
pub const TYPING_TOPIC_PREFIX: &str = "typing:";
