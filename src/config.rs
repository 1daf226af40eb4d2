//! Environment configuration.

use std::env;
use std::time::Duration;

pub const DEFAULT_MAX_CACHED_MESSAGE_AGE: u64 = 2;
pub const DEFAULT_DISCONNECTED_SESSION_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_STORED_SESSIONS: usize = 128;
pub const DEFAULT_MESSAGES_PER_YIELD: usize = 32;
pub const DEFAULT_SOURCE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Completed runs a cached message reference stays valid for.
    pub max_cached_message_age: u64,
    /// Smallest serialized delta, in bytes, eligible for reference substitution.
    pub min_cached_message_size: usize,
    pub display_enabled: bool,
    pub run_on_save: bool,
    pub allow_run_on_save: bool,
    pub disconnected_session_ttl: Duration,
    pub max_stored_sessions: usize,
    pub messages_per_yield: usize,
    /// How often the loop polls watched source files. `None` disables polling.
    pub source_poll_interval: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_cached_message_age: DEFAULT_MAX_CACHED_MESSAGE_AGE,
            min_cached_message_size: 0,
            display_enabled: true,
            run_on_save: false,
            allow_run_on_save: true,
            disconnected_session_ttl: DEFAULT_DISCONNECTED_SESSION_TTL,
            max_stored_sessions: DEFAULT_MAX_STORED_SESSIONS,
            messages_per_yield: DEFAULT_MESSAGES_PER_YIELD,
            source_poll_interval: Some(DEFAULT_SOURCE_POLL_INTERVAL),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_cached_message_age: env_parse("SCRIPTFLOW_MAX_CACHED_MESSAGE_AGE")
                .unwrap_or(defaults.max_cached_message_age),
            min_cached_message_size: env_parse("SCRIPTFLOW_MIN_CACHED_MESSAGE_SIZE")
                .unwrap_or(defaults.min_cached_message_size),
            display_enabled: !env_flag("SCRIPTFLOW_DISABLE_DISPLAY"),
            run_on_save: env_flag("SCRIPTFLOW_RUN_ON_SAVE"),
            allow_run_on_save: !env_flag("SCRIPTFLOW_DISALLOW_RUN_ON_SAVE"),
            disconnected_session_ttl: env_parse("SCRIPTFLOW_DISCONNECTED_SESSION_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.disconnected_session_ttl),
            max_stored_sessions: env_parse("SCRIPTFLOW_MAX_STORED_SESSIONS")
                .unwrap_or(defaults.max_stored_sessions),
            messages_per_yield: env_parse::<usize>("SCRIPTFLOW_MESSAGES_PER_YIELD")
                .filter(|count| *count > 0)
                .unwrap_or(defaults.messages_per_yield),
            source_poll_interval: match env_parse::<u64>("SCRIPTFLOW_SOURCE_POLL_MS") {
                Some(0) => None,
                Some(millis) => Some(Duration::from_millis(millis)),
                None => defaults.source_poll_interval,
            },
        }
    }

    #[must_use]
    pub fn with_max_cached_message_age(mut self, age: u64) -> Self {
        self.max_cached_message_age = age;
        self
    }

    #[must_use]
    pub fn with_min_cached_message_size(mut self, size: usize) -> Self {
        self.min_cached_message_size = size;
        self
    }

    #[must_use]
    pub fn with_display_enabled(mut self, enabled: bool) -> Self {
        self.display_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_run_on_save(mut self, enabled: bool) -> Self {
        self.run_on_save = enabled;
        self
    }

    #[must_use]
    pub fn with_disconnected_session_ttl(mut self, ttl: Duration) -> Self {
        self.disconnected_session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_stored_sessions(mut self, max: usize) -> Self {
        self.max_stored_sessions = max;
        self
    }

    #[must_use]
    pub fn with_messages_per_yield(mut self, count: usize) -> Self {
        self.messages_per_yield = count.max(1);
        self
    }

    #[must_use]
    pub fn with_source_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.source_poll_interval = interval;
        self
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|value| value == "1").unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| {
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            value.parse().ok()
        }
    })
}
