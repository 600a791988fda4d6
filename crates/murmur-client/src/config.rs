//! Sync core configuration loaded from environment variables.
//!
//! Every setting has a default, so a client starts with zero configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_store::{Database, Result as StoreResult};

use murmur_shared::constants::{
    DEFAULT_ECHO_SWEEP_MS, DEFAULT_ECHO_TIMEOUT_MS, DEFAULT_PENDING_LIMIT, DEFAULT_PINNED_CAP,
    DEFAULT_RATE_MAX_SENDS, DEFAULT_RATE_WINDOW_SECS, DEFAULT_RECONNECT_BASE_MS,
    DEFAULT_RECONNECT_MAX_MS, DEFAULT_TIMELINE_LIMIT, DEFAULT_TYPING_DEBOUNCE_MS,
    DEFAULT_TYPING_STALE_MS, DEFAULT_WRITE_TIMEOUT_MS, MAX_BODY_LEN,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Most recent messages requested per snapshot.
    /// Env: `MURMUR_TIMELINE_LIMIT`
    /// Default: `150`
    pub timeline_limit: usize,

    /// Unmatched echoes allowed before sends are refused with a backlog error.
    /// Env: `MURMUR_PENDING_LIMIT`
    /// Default: `20`
    pub pending_limit: usize,

    /// Age at which an unmatched echo is marked failed.
    /// Env: `MURMUR_ECHO_TIMEOUT_MS`
    /// Default: `8000`
    pub echo_timeout: Duration,

    /// Deadline for a single store write. A write past it counts as failed
    /// and the next queued write starts.
    /// Env: `MURMUR_WRITE_TIMEOUT_MS`
    /// Default: `15000`
    pub write_timeout: Duration,

    /// How often echoes are checked for expiry.
    /// Env: `MURMUR_ECHO_SWEEP_MS`
    /// Default: `500`
    pub echo_sweep_interval: Duration,

    /// Quiet period after the last keystroke before `is_typing=false` is sent.
    /// Env: `MURMUR_TYPING_DEBOUNCE_MS`
    /// Default: `2000`
    pub typing_debounce: Duration,

    /// Remote typing records older than this are ignored.
    /// Env: `MURMUR_TYPING_STALE_MS`
    /// Default: `10000`
    pub typing_stale_after: Duration,

    /// Hard ceiling on message body length, in characters.
    /// Env: `MURMUR_MAX_BODY_LEN`
    /// Default: `5000`
    pub max_body_len: usize,

    /// Sends allowed per rate window.
    /// Env: `MURMUR_RATE_MAX`
    /// Default: `10`
    pub rate_max_sends: usize,

    /// Sliding rate window.
    /// Env: `MURMUR_RATE_WINDOW_SECS`
    /// Default: `10`
    pub rate_window: Duration,

    /// Entries kept in the pinned-messages list.
    /// Env: `MURMUR_PINNED_CAP`
    /// Default: `10`
    pub pinned_cap: usize,

    /// First resubscribe delay after a subscription error.
    /// Env: `MURMUR_RECONNECT_BASE_MS`
    /// Default: `500`
    pub reconnect_base: Duration,

    /// Upper bound on the resubscribe delay.
    /// Env: `MURMUR_RECONNECT_MAX_MS`
    /// Default: `30000`
    pub reconnect_max: Duration,

    /// Local database file. `None` means the platform data directory.
    /// Env: `MURMUR_DB_PATH`
    pub database_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeline_limit: DEFAULT_TIMELINE_LIMIT,
            pending_limit: DEFAULT_PENDING_LIMIT,
            echo_timeout: Duration::from_millis(DEFAULT_ECHO_TIMEOUT_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            echo_sweep_interval: Duration::from_millis(DEFAULT_ECHO_SWEEP_MS),
            typing_debounce: Duration::from_millis(DEFAULT_TYPING_DEBOUNCE_MS),
            typing_stale_after: Duration::from_millis(DEFAULT_TYPING_STALE_MS),
            max_body_len: MAX_BODY_LEN,
            rate_max_sends: DEFAULT_RATE_MAX_SENDS,
            rate_window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
            pinned_cap: DEFAULT_PINNED_CAP,
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            database_path: None,
        }
    }
}

impl SyncConfig {
    /// Open the configured database, or the one in the platform data
    /// directory when no path is set.
    pub fn open_database(&self) -> StoreResult<Database> {
        match &self.database_path {
            Some(path) => Database::open_at(path),
            None => Database::new(),
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` uses the
    /// process environment; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        set_parsed(&lookup, "MURMUR_TIMELINE_LIMIT", &mut config.timeline_limit);
        set_parsed(&lookup, "MURMUR_PENDING_LIMIT", &mut config.pending_limit);
        set_parsed(&lookup, "MURMUR_MAX_BODY_LEN", &mut config.max_body_len);
        set_parsed(&lookup, "MURMUR_RATE_MAX", &mut config.rate_max_sends);
        set_parsed(&lookup, "MURMUR_PINNED_CAP", &mut config.pinned_cap);

        set_millis(&lookup, "MURMUR_ECHO_TIMEOUT_MS", &mut config.echo_timeout);
        set_millis(&lookup, "MURMUR_WRITE_TIMEOUT_MS", &mut config.write_timeout);
        set_millis(&lookup, "MURMUR_ECHO_SWEEP_MS", &mut config.echo_sweep_interval);
        set_millis(&lookup, "MURMUR_TYPING_DEBOUNCE_MS", &mut config.typing_debounce);
        set_millis(&lookup, "MURMUR_TYPING_STALE_MS", &mut config.typing_stale_after);
        set_millis(&lookup, "MURMUR_RECONNECT_BASE_MS", &mut config.reconnect_base);
        set_millis(&lookup, "MURMUR_RECONNECT_MAX_MS", &mut config.reconnect_max);

        let mut window_secs = config.rate_window.as_secs();
        set_parsed(&lookup, "MURMUR_RATE_WINDOW_SECS", &mut window_secs);
        config.rate_window = Duration::from_secs(window_secs);

        if let Some(path) = lookup("MURMUR_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if config.echo_sweep_interval.is_zero() {
            tracing::warn!("MURMUR_ECHO_SWEEP_MS must be positive, using default");
            config.echo_sweep_interval = Duration::from_millis(DEFAULT_ECHO_SWEEP_MS);
        }
        if config.write_timeout.is_zero() {
            tracing::warn!("MURMUR_WRITE_TIMEOUT_MS must be positive, using default");
            config.write_timeout = Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS);
        }
        if config.reconnect_max < config.reconnect_base {
            tracing::warn!(
                base = ?config.reconnect_base,
                max = ?config.reconnect_max,
                "Reconnect max below base, clamping"
            );
            config.reconnect_max = config.reconnect_base;
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
        }
    }
}

fn set_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    set_parsed(lookup, key, &mut millis);
    *slot = Duration::from_millis(millis);
}
