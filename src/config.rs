//! Runtime configuration loaded from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a typed default so the server starts with only
//! `DATABASE_URL` set. Unparseable values fall back to the default rather
//! than aborting startup; `main` logs the effective values.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 2000;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;
/// Seven days.
pub const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 604_800;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    MissingEnvVar(&'static str),
}

/// Parse `key` from the environment, falling back to `default` when unset
/// or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period before a dirty room snapshot is written.
    pub save_debounce: Duration,
    /// Upper bound on the access check during `room:join`.
    pub join_timeout: Duration,
    /// Bounded outbound queue per connection.
    pub client_queue_capacity: usize,
    /// Age after which tombstones are compacted on flush.
    pub tombstone_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(DEFAULT_SAVE_DEBOUNCE_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            tombstone_ttl: Duration::from_secs(DEFAULT_TOMBSTONE_TTL_SECS),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            save_debounce: Duration::from_millis(env_parse("SAVE_DEBOUNCE_MS", DEFAULT_SAVE_DEBOUNCE_MS)),
            join_timeout: Duration::from_millis(env_parse("JOIN_TIMEOUT_MS", DEFAULT_JOIN_TIMEOUT_MS)),
            client_queue_capacity: env_parse("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY).max(1),
            tombstone_ttl: Duration::from_secs(env_parse("TOMBSTONE_TTL_SECS", DEFAULT_TOMBSTONE_TTL_SECS)),
        }
    }

    /// Tombstone TTL in milliseconds, saturating.
    #[must_use]
    pub fn tombstone_ttl_ms(&self) -> i64 {
        i64::try_from(self.tombstone_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Process-level settings: where to listen and what to connect to.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub port: u16,
    pub sync: SyncConfig,
}

impl ServerConfig {
    /// Load from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] when `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL"))?;
        Ok(Self { database_url, port: env_parse("PORT", DEFAULT_PORT), sync: SyncConfig::from_env() })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
